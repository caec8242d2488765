//! Launch templates, fleet groups and instance refreshes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Versioned launch configuration for one environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Immutable snapshots, numbered from 1
    #[serde(default)]
    pub versions: Vec<TemplateVersion>,

    /// Version new instances are launched from
    pub default_version: Option<u32>,
}

impl LaunchTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: BTreeMap::new(),
            versions: Vec::new(),
            default_version: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn latest_version(&self) -> Option<&TemplateVersion> {
        self.versions.last()
    }

    pub fn version(&self, number: u32) -> Option<&TemplateVersion> {
        self.versions.iter().find(|v| v.number == number)
    }

    /// The version currently marked as default
    pub fn default(&self) -> Option<&TemplateVersion> {
        self.default_version.and_then(|n| self.version(n))
    }

    /// Version previously created with this client token
    pub fn version_for_token(&self, token: &str) -> Option<&TemplateVersion> {
        self.versions
            .iter()
            .find(|v| v.client_token.as_deref() == Some(token))
    }

    /// Append a version, returning the existing one when the client token
    /// was already used.
    pub fn push_version(&mut self, request: CreateVersionRequest) -> TemplateVersion {
        if let Some(token) = request.client_token.as_deref() {
            if let Some(existing) = self.version_for_token(token) {
                return existing.clone();
            }
        }

        let number = self.versions.last().map(|v| v.number + 1).unwrap_or(1);
        let version = TemplateVersion {
            number,
            image_id: request.image_id,
            description: request.description,
            created_at: Utc::now(),
            client_token: request.client_token,
        };
        self.versions.push(version.clone());
        version
    }
}

/// One immutable launch template snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub number: u32,

    /// Image instances are launched from
    pub image_id: String,

    pub description: String,

    pub created_at: DateTime<Utc>,

    /// Idempotency token supplied by the creator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Request to create a new template version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVersionRequest {
    pub image_id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Auto-scaling group consuming a launch template's default version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetGroup {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    pub desired_capacity: u32,
}

impl FleetGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, desired_capacity: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: BTreeMap::new(),
            desired_capacity,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Rolling replacement preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPreferences {
    pub min_healthy_percentage: u8,

    pub instance_warmup_secs: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_percentages: Vec<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_delay_secs: Option<u32>,
}

impl RefreshPreferences {
    /// Staged rollout used when deploying a new image
    pub fn staged() -> Self {
        Self {
            min_healthy_percentage: 90,
            instance_warmup_secs: 300,
            checkpoint_percentages: vec![50, 100],
            checkpoint_delay_secs: Some(300),
        }
    }

    /// Single pass used when rolling back
    pub fn single_pass() -> Self {
        Self {
            min_healthy_percentage: 90,
            instance_warmup_secs: 300,
            checkpoint_percentages: Vec::new(),
            checkpoint_delay_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Pending,
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

/// A started instance refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRefresh {
    pub id: String,

    pub fleet_id: String,

    pub preferences: RefreshPreferences,

    pub status: RefreshStatus,

    pub percentage_complete: u8,

    pub started_at: DateTime<Utc>,
}
