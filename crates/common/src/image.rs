//! Golden image artifacts and the tag vocabulary used to track promotion.
//!
//! Images are created by the build backend and are immutable apart from
//! their tags. The promotion controller only reads their state and writes
//! tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Environment, Error, Result};

/// Tag keys recognised by the promotion controller
pub mod tags {
    pub const ENVIRONMENT: &str = "Environment";
    pub const PRODUCTION: &str = "Production";
    pub const STATUS: &str = "Status";
    pub const LAST_DEPLOYED: &str = "LastDeployed";
    pub const DEPLOYED_TO: &str = "DeployedTo";
    pub const ROLLED_BACK_DATE: &str = "RolledBackDate";
    pub const ROLLBACK_REASON: &str = "RollbackReason";
    pub const SUPERSEDED_DATE: &str = "SupersededDate";

    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const SUPERSEDED: &str = "Superseded";
}

/// Query-string prefix used to encode tag filters
pub const TAG_QUERY_PREFIX: &str = "tag.";

/// Lifecycle state of an image, owned by the build backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Pending,
    Available,
    Failed,
    Deregistered,
}

impl ImageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageState::Pending => "pending",
            ImageState::Available => "available",
            ImageState::Failed => "failed",
            ImageState::Deregistered => "deregistered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ImageState::Pending),
            "available" => Some(ImageState::Available),
            "failed" => Some(ImageState::Failed),
            "deregistered" => Some(ImageState::Deregistered),
            _ => None,
        }
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable golden image artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Opaque identifier assigned by the registry
    pub id: String,

    /// Lifecycle state
    pub state: ImageState,

    /// Free-form key/value tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// When the image was created; the ordering key for selection
    pub creation_date: DateTime<Utc>,
}

impl Image {
    /// Create an untagged image record
    pub fn new(id: impl Into<String>, state: ImageState, creation_date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state,
            tags: BTreeMap::new(),
            creation_date,
        }
    }

    /// Builder-style tag setter
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Environment from the `Environment` tag, if present and valid
    pub fn environment(&self) -> Option<Environment> {
        self.tag(tags::ENVIRONMENT).and_then(|e| e.parse().ok())
    }

    /// Whether the image carries `Production=true`
    pub fn is_production(&self) -> bool {
        self.tag(tags::PRODUCTION) == Some(tags::TRUE)
    }

    pub fn is_available(&self) -> bool {
        self.state == ImageState::Available
    }

    /// Fail with `ImageNotAvailable` unless the image can be deployed
    pub fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::ImageNotAvailable {
                id: self.id.clone(),
                state: self.state.to_string(),
            })
        }
    }
}

/// Sort images oldest first. Ties on creation date fall back to the id so
/// the order is total.
pub fn sort_by_creation(images: &mut [Image]) {
    images.sort_by(|a, b| {
        a.creation_date
            .cmp(&b.creation_date)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Tag and state filter for image listings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFilter {
    /// Every listed tag must be present with exactly this value
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ImageState>,
}

impl ImageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter for images tagged with the given environment
    pub fn for_environment(environment: Environment) -> Self {
        Self::new().tag(tags::ENVIRONMENT, environment.as_str())
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn state(mut self, state: ImageState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, image: &Image) -> bool {
        if let Some(state) = self.state {
            if image.state != state {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(k, v)| image.tags.get(k).map(|actual| actual == v).unwrap_or(false))
    }

    /// Encode as query parameters (`tag.<Key>=<Value>`, `state=<state>`)
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .tags
            .iter()
            .map(|(k, v)| (format!("{}{}", TAG_QUERY_PREFIX, k), v.clone()))
            .collect();
        if let Some(state) = self.state {
            pairs.push(("state".to_string(), state.as_str().to_string()));
        }
        pairs
    }

    /// Decode query parameters produced by [`ImageFilter::to_query_pairs`].
    /// Unknown parameters are ignored.
    pub fn from_query_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut filter = ImageFilter::new();
        for (key, value) in pairs {
            if let Some(tag) = key.strip_prefix(TAG_QUERY_PREFIX) {
                filter.tags.insert(tag.to_string(), value.clone());
            } else if key == "state" {
                let state = ImageState::parse(value)
                    .ok_or_else(|| Error::Backend(format!("unknown image state: {}", value)))?;
                filter.state = Some(state);
            }
        }
        Ok(filter)
    }
}

/// Tag-only filter, used to find launch templates and fleet groups
pub fn tags_match(filter: &BTreeMap<String, String>, tags: &BTreeMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(k, v)| tags.get(k).map(|actual| actual == v).unwrap_or(false))
}
