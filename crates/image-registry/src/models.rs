//! Request and response bodies for the registry API

use chrono::{DateTime, Utc};
use promotion_common::{
    FleetGroup, Image, ImageState, InstanceRefresh, LaunchTemplate, RefreshStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate a provider-style identifier such as `ami-0f3a9c1d2b4e5f607`
pub fn generate_id(prefix: &str) -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..17])
}

/// Request to register a newly built image
#[derive(Debug, Deserialize)]
pub struct RegisterImageRequest {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub state: Option<ImageState>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
}

impl RegisterImageRequest {
    pub fn into_image(self) -> Image {
        Image {
            id: self.id.unwrap_or_else(|| generate_id("ami")),
            state: self.state.unwrap_or(ImageState::Pending),
            tags: self.tags,
            creation_date: self.creation_date.unwrap_or_else(Utc::now),
        }
    }
}

/// Tags to merge into an existing resource
#[derive(Debug, Serialize, Deserialize)]
pub struct SetTagsRequest {
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub state: ImageState,
}

#[derive(Debug, Serialize)]
pub struct ImagesListResponse {
    pub images: Vec<Image>,
    pub total: usize,
}

/// Request to register a launch template
#[derive(Debug, Deserialize)]
pub struct RegisterTemplateRequest {
    #[serde(default)]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl RegisterTemplateRequest {
    pub fn into_template(self) -> LaunchTemplate {
        LaunchTemplate {
            id: self.id.unwrap_or_else(|| generate_id("lt")),
            name: self.name,
            tags: self.tags,
            versions: Vec::new(),
            default_version: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetDefaultVersionRequest {
    pub version: u32,
}

#[derive(Debug, Serialize)]
pub struct TemplatesListResponse {
    pub templates: Vec<LaunchTemplate>,
    pub total: usize,
}

/// Request to register a fleet group
#[derive(Debug, Deserialize)]
pub struct RegisterFleetRequest {
    #[serde(default)]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub desired_capacity: u32,
}

impl RegisterFleetRequest {
    pub fn into_fleet(self) -> FleetGroup {
        FleetGroup {
            id: self.id.unwrap_or_else(|| generate_id("asg")),
            name: self.name,
            tags: self.tags,
            desired_capacity: self.desired_capacity,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FleetsListResponse {
    pub fleets: Vec<FleetGroup>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub refresh: InstanceRefresh,
}

/// Progress report for an instance refresh. The registry never advances a
/// refresh by itself; whatever drives the fleet posts updates here.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRefreshRequest {
    pub status: RefreshStatus,

    #[serde(default)]
    pub percentage_complete: Option<u8>,
}

impl UpdateRefreshRequest {
    /// Apply the update. A successful refresh is complete unless told otherwise.
    pub fn apply(&self, refresh: &mut InstanceRefresh) -> Result<(), String> {
        let percentage = match (self.percentage_complete, self.status) {
            (Some(p), _) if p > 100 => {
                return Err(format!("percentage_complete must be at most 100, got {}", p))
            }
            (Some(p), _) => p,
            (None, RefreshStatus::Successful) => 100,
            (None, _) => refresh.percentage_complete,
        };

        refresh.status = self.status;
        refresh.percentage_complete = percentage;
        Ok(())
    }
}

/// Request to take the per-environment lease
#[derive(Debug, Serialize, Deserialize)]
pub struct AcquireLeaseRequest {
    pub holder: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLeaseQuery {
    pub holder: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseLeaseResponse {
    pub released: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id("ami");
        assert!(id.starts_with("ami-"));
        assert_eq!(id.len(), 4 + 17);
    }

    #[test]
    fn test_register_image_defaults() {
        let request: RegisterImageRequest =
            serde_json::from_str(r#"{"tags":{"Environment":"dev"}}"#).unwrap();
        let image = request.into_image();
        assert_eq!(image.state, ImageState::Pending);
        assert_eq!(image.tag("Environment"), Some("dev"));
        assert!(image.id.starts_with("ami-"));
    }

    fn pending_refresh() -> InstanceRefresh {
        InstanceRefresh {
            id: "r-1".to_string(),
            fleet_id: "asg-web".to_string(),
            preferences: promotion_common::RefreshPreferences::staged(),
            status: RefreshStatus::Pending,
            percentage_complete: 0,
            started_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_refresh_progress_updates() {
        let mut refresh = pending_refresh();

        let update: UpdateRefreshRequest =
            serde_json::from_str(r#"{"status":"in_progress","percentage_complete":50}"#).unwrap();
        update.apply(&mut refresh).unwrap();
        assert_eq!(refresh.status, RefreshStatus::InProgress);
        assert_eq!(refresh.percentage_complete, 50);

        let update: UpdateRefreshRequest = serde_json::from_str(r#"{"status":"failed"}"#).unwrap();
        update.apply(&mut refresh).unwrap();
        assert_eq!(refresh.status, RefreshStatus::Failed);
        assert_eq!(refresh.percentage_complete, 50);

        let update: UpdateRefreshRequest =
            serde_json::from_str(r#"{"status":"successful"}"#).unwrap();
        update.apply(&mut refresh).unwrap();
        assert_eq!(refresh.percentage_complete, 100);
    }

    #[test]
    fn test_refresh_progress_rejects_over_100() {
        let mut refresh = pending_refresh();
        let update = UpdateRefreshRequest {
            status: RefreshStatus::InProgress,
            percentage_complete: Some(101),
        };
        assert!(update.apply(&mut refresh).is_err());
        assert_eq!(refresh.status, RefreshStatus::Pending);
        assert_eq!(refresh.percentage_complete, 0);
    }

    #[test]
    fn test_register_fleet_keeps_explicit_id() {
        let request: RegisterFleetRequest = serde_json::from_str(
            r#"{"id":"asg-web","name":"web","desired_capacity":4}"#,
        )
        .unwrap();
        let fleet = request.into_fleet();
        assert_eq!(fleet.id, "asg-web");
        assert_eq!(fleet.desired_capacity, 4);
    }
}
