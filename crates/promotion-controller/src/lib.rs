//! Golden image promotion controller
//!
//! Promotes a chosen machine image into an environment's launch template,
//! rolls the fleet onto it, and keeps the tag and rollback audit trail.

pub mod audit;
pub mod backend;
pub mod config;
pub mod controller;
pub mod gate;
pub mod rollout;
pub mod selection;

pub use audit::AuditLog;
pub use backend::{Cloud, HttpBackend, MemoryBackend, Seed};
pub use config::{BackendKind, Config};
pub use controller::{
    Controller, ControllerSettings, DeployOutcome, DeployReport, RollbackOutcome, RollbackReport,
    StatusReport,
};
pub use gate::{Console, ScriptedConsole, StdConsole};
