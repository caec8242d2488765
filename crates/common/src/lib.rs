pub mod environment;
pub mod error;
pub mod fleet;
pub mod image;
pub mod record;

pub use environment::Environment;
pub use error::{Error, Result};
pub use fleet::{
    CreateVersionRequest, FleetGroup, InstanceRefresh, LaunchTemplate, RefreshPreferences,
    RefreshStatus, TemplateVersion,
};
pub use image::{sort_by_creation, tags, tags_match, Image, ImageFilter, ImageState};
pub use record::{
    format_timestamp, LeaseGrant, ProductionPointer, RollbackRecord, MAX_LEASE_TTL_SECS,
};
