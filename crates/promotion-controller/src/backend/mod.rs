//! Collaborator interfaces consumed by the promotion controller.
//!
//! Each trait mirrors one slice of the provider's compute API. The
//! controller only needs the union of them, expressed as [`Cloud`].

use async_trait::async_trait;
use promotion_common::{
    CreateVersionRequest, Environment, FleetGroup, Image, ImageFilter, InstanceRefresh,
    LaunchTemplate, LeaseGrant, ProductionPointer, RefreshPreferences, Result, TemplateVersion,
};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod http;
pub mod memory;

pub use http::HttpBackend;
pub use memory::{MemoryBackend, Seed};

/// Image list/describe/tag-write
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Images matching the filter, in no particular order
    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<Image>>;

    async fn get_image(&self, id: &str) -> Result<Option<Image>>;

    /// Merge tags into an image
    async fn set_tags(&self, id: &str, tags: BTreeMap<String, String>) -> Result<()>;
}

/// Launch-template describe/create-version/modify-default
#[async_trait]
pub trait LaunchTemplateApi: Send + Sync {
    async fn find_templates(&self, tags: &BTreeMap<String, String>) -> Result<Vec<LaunchTemplate>>;

    /// Create a version; a repeated client token returns the existing version
    async fn create_version(
        &self,
        template_id: &str,
        request: CreateVersionRequest,
    ) -> Result<TemplateVersion>;

    async fn set_default_version(&self, template_id: &str, version: u32) -> Result<()>;
}

/// Fleet group describe/start-instance-refresh/describe-instance-refresh
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn find_fleets(&self, tags: &BTreeMap<String, String>) -> Result<Vec<FleetGroup>>;

    async fn start_instance_refresh(
        &self,
        fleet_id: &str,
        preferences: &RefreshPreferences,
    ) -> Result<InstanceRefresh>;

    async fn describe_instance_refresh(
        &self,
        fleet_id: &str,
        refresh_id: &str,
    ) -> Result<Option<InstanceRefresh>>;
}

/// Production pointers and per-environment promotion leases
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_pointer(&self, environment: Environment) -> Result<Option<ProductionPointer>>;

    async fn set_pointer(&self, pointer: &ProductionPointer) -> Result<()>;

    async fn acquire_lease(
        &self,
        environment: Environment,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseGrant>;

    /// Returns false if `holder` no longer owned the lease
    async fn release_lease(&self, environment: Environment, holder: &str) -> Result<bool>;
}

/// Everything the controller talks to
pub trait Cloud: ImageRegistry + LaunchTemplateApi + FleetApi + ControlPlane {}

impl<T> Cloud for T where T: ImageRegistry + LaunchTemplateApi + FleetApi + ControlPlane {}
