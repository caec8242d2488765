//! In-memory compute API
//!
//! Holds images, templates and fleet groups in process. Used by the test
//! suite and for dry runs seeded from a JSON fixture; nothing is persisted.

use async_trait::async_trait;
use chrono::Utc;
use promotion_common::{
    tags_match, CreateVersionRequest, Environment, Error, FleetGroup, Image, ImageFilter,
    InstanceRefresh, LaunchTemplate, LeaseGrant, ProductionPointer, RefreshPreferences,
    RefreshStatus, Result, TemplateVersion, MAX_LEASE_TTL_SECS,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ControlPlane, FleetApi, ImageRegistry, LaunchTemplateApi};

/// Initial contents of a memory backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub images: Vec<Image>,

    #[serde(default)]
    pub templates: Vec<LaunchTemplate>,

    #[serde(default)]
    pub fleets: Vec<FleetGroup>,

    #[serde(default)]
    pub pointers: Vec<ProductionPointer>,
}

impl Seed {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Expiry of a lease taken now, refusing TTLs past the one-day ceiling
fn lease_expiry(ttl: Duration) -> Result<Instant> {
    if ttl > Duration::from_secs(MAX_LEASE_TTL_SECS) {
        return Err(Error::Backend(format!(
            "Lease TTL {}s exceeds the maximum of {}s",
            ttl.as_secs(),
            MAX_LEASE_TTL_SECS
        )));
    }
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| Error::Backend(format!("Lease TTL {}s is out of range", ttl.as_secs())))
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    images: BTreeMap<String, Image>,
    templates: BTreeMap<String, LaunchTemplate>,
    fleets: BTreeMap<String, FleetGroup>,
    refreshes: HashMap<String, InstanceRefresh>,
    pointers: HashMap<Environment, ProductionPointer>,
    leases: HashMap<Environment, Lease>,
    calls: Vec<String>,
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let state = State {
            images: seed.images.into_iter().map(|i| (i.id.clone(), i)).collect(),
            templates: seed
                .templates
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            fleets: seed.fleets.into_iter().map(|f| (f.id.clone(), f)).collect(),
            pointers: seed
                .pointers
                .into_iter()
                .map(|p| (p.environment, p))
                .collect(),
            ..State::default()
        };

        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn insert_image(&self, image: Image) {
        let mut state = self.state.lock().await;
        state.images.insert(image.id.clone(), image);
    }

    pub async fn insert_template(&self, template: LaunchTemplate) {
        let mut state = self.state.lock().await;
        state.templates.insert(template.id.clone(), template);
    }

    pub async fn insert_fleet(&self, fleet: FleetGroup) {
        let mut state = self.state.lock().await;
        state.fleets.insert(fleet.id.clone(), fleet);
    }

    pub async fn image(&self, id: &str) -> Option<Image> {
        self.state.lock().await.images.get(id).cloned()
    }

    pub async fn template(&self, id: &str) -> Option<LaunchTemplate> {
        self.state.lock().await.templates.get(id).cloned()
    }

    pub async fn refreshes(&self) -> Vec<InstanceRefresh> {
        let state = self.state.lock().await;
        let mut refreshes: Vec<_> = state.refreshes.values().cloned().collect();
        refreshes.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        refreshes
    }

    pub async fn pointer(&self, environment: Environment) -> Option<ProductionPointer> {
        self.state.lock().await.pointers.get(&environment).cloned()
    }

    /// Names of every API call made so far, in order
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Hold the lease on behalf of someone else
    pub async fn hold_lease(
        &self,
        environment: Environment,
        holder: &str,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = lease_expiry(ttl)?;
        let mut state = self.state.lock().await;
        state.leases.insert(
            environment,
            Lease {
                holder: holder.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    pub async fn lease_holder(&self, environment: Environment) -> Option<String> {
        let state = self.state.lock().await;
        state
            .leases
            .get(&environment)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone())
    }
}

fn record(state: &mut State, call: String) {
    debug!("Memory backend: {}", call);
    state.calls.push(call);
}

#[async_trait]
impl ImageRegistry for MemoryBackend {
    async fn list_images(&self, filter: &ImageFilter) -> Result<Vec<Image>> {
        let mut state = self.state.lock().await;
        record(&mut state, "list_images".to_string());

        Ok(state
            .images
            .values()
            .filter(|image| filter.matches(image))
            .cloned()
            .collect())
    }

    async fn get_image(&self, id: &str) -> Result<Option<Image>> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("get_image {}", id));

        Ok(state.images.get(id).cloned())
    }

    async fn set_tags(&self, id: &str, tags: BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("set_tags {}", id));

        let image = state
            .images
            .get_mut(id)
            .ok_or_else(|| Error::Backend(format!("Image not found: {}", id)))?;
        image.tags.extend(tags);
        Ok(())
    }
}

#[async_trait]
impl LaunchTemplateApi for MemoryBackend {
    async fn find_templates(&self, tags: &BTreeMap<String, String>) -> Result<Vec<LaunchTemplate>> {
        let mut state = self.state.lock().await;
        record(&mut state, "find_templates".to_string());

        Ok(state
            .templates
            .values()
            .filter(|t| tags_match(tags, &t.tags))
            .cloned()
            .collect())
    }

    async fn create_version(
        &self,
        template_id: &str,
        request: CreateVersionRequest,
    ) -> Result<TemplateVersion> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("create_version {}", template_id));

        let template = state
            .templates
            .get_mut(template_id)
            .ok_or_else(|| Error::Backend(format!("Launch template not found: {}", template_id)))?;
        Ok(template.push_version(request))
    }

    async fn set_default_version(&self, template_id: &str, version: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        record(
            &mut state,
            format!("set_default_version {} {}", template_id, version),
        );

        let template = state
            .templates
            .get_mut(template_id)
            .ok_or_else(|| Error::Backend(format!("Launch template not found: {}", template_id)))?;
        if template.version(version).is_none() {
            return Err(Error::Backend(format!(
                "Launch template {} has no version {}",
                template_id, version
            )));
        }
        template.default_version = Some(version);
        Ok(())
    }
}

#[async_trait]
impl FleetApi for MemoryBackend {
    async fn find_fleets(&self, tags: &BTreeMap<String, String>) -> Result<Vec<FleetGroup>> {
        let mut state = self.state.lock().await;
        record(&mut state, "find_fleets".to_string());

        Ok(state
            .fleets
            .values()
            .filter(|f| tags_match(tags, &f.tags))
            .cloned()
            .collect())
    }

    async fn start_instance_refresh(
        &self,
        fleet_id: &str,
        preferences: &RefreshPreferences,
    ) -> Result<InstanceRefresh> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("start_instance_refresh {}", fleet_id));

        if !state.fleets.contains_key(fleet_id) {
            return Err(Error::Backend(format!("Fleet group not found: {}", fleet_id)));
        }

        let refresh = InstanceRefresh {
            id: uuid::Uuid::new_v4().to_string(),
            fleet_id: fleet_id.to_string(),
            preferences: preferences.clone(),
            status: RefreshStatus::Pending,
            percentage_complete: 0,
            started_at: Utc::now(),
        };
        state.refreshes.insert(refresh.id.clone(), refresh.clone());
        Ok(refresh)
    }

    async fn describe_instance_refresh(
        &self,
        fleet_id: &str,
        refresh_id: &str,
    ) -> Result<Option<InstanceRefresh>> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("describe_instance_refresh {}", refresh_id));

        Ok(state
            .refreshes
            .get(refresh_id)
            .filter(|r| r.fleet_id == fleet_id)
            .cloned())
    }
}

#[async_trait]
impl ControlPlane for MemoryBackend {
    async fn get_pointer(&self, environment: Environment) -> Result<Option<ProductionPointer>> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("get_pointer {}", environment));

        Ok(state.pointers.get(&environment).cloned())
    }

    async fn set_pointer(&self, pointer: &ProductionPointer) -> Result<()> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("set_pointer {}", pointer.environment));

        state.pointers.insert(pointer.environment, pointer.clone());
        Ok(())
    }

    async fn acquire_lease(
        &self,
        environment: Environment,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseGrant> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("acquire_lease {}", environment));

        let expires_at = lease_expiry(ttl)?;
        if let Some(lease) = state.leases.get(&environment) {
            if lease.expires_at > Instant::now() && lease.holder != holder {
                return Ok(LeaseGrant::Held {
                    holder: lease.holder.clone(),
                });
            }
        }

        state.leases.insert(
            environment,
            Lease {
                holder: holder.to_string(),
                expires_at,
            },
        );
        Ok(LeaseGrant::Acquired)
    }

    async fn release_lease(&self, environment: Environment, holder: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        record(&mut state, format!("release_lease {}", environment));

        match state.leases.get(&environment) {
            Some(lease) if lease.holder == holder => {
                state.leases.remove(&environment);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
