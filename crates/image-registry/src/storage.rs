//! Redis storage for the registry
//!
//! Every key is partitioned by region. Resources are stored as JSON values
//! with a per-region set acting as the index.

use anyhow::{Context, Result};
use chrono::Utc;
use promotion_common::{
    tags_match, CreateVersionRequest, Environment, FleetGroup, Image, ImageFilter, ImageState,
    InstanceRefresh, LaunchTemplate, LeaseGrant, ProductionPointer, RefreshPreferences,
    RefreshStatus, TemplateVersion, MAX_LEASE_TTL_SECS,
};
use crate::models::UpdateRefreshRequest;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Deletes the lease only if it is still owned by the caller
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

fn image_key(region: &str, id: &str) -> String {
    format!("image:{}:{}", region, id)
}

fn images_index(region: &str) -> String {
    format!("images:{}", region)
}

fn template_key(region: &str, id: &str) -> String {
    format!("template:{}:{}", region, id)
}

fn templates_index(region: &str) -> String {
    format!("templates:{}", region)
}

fn fleet_key(region: &str, id: &str) -> String {
    format!("fleet:{}:{}", region, id)
}

fn fleets_index(region: &str) -> String {
    format!("fleets:{}", region)
}

fn refresh_key(region: &str, fleet_id: &str, refresh_id: &str) -> String {
    format!("refresh:{}:{}:{}", region, fleet_id, refresh_id)
}

fn pointer_key(region: &str, environment: Environment) -> String {
    format!("pointer:{}:{}", region, environment)
}

fn lease_key(region: &str, environment: Environment) -> String {
    format!("lease:{}:{}", region, environment)
}

/// Outcome of moving a template's default version
#[derive(Debug)]
pub enum DefaultVersionUpdate {
    Updated(LaunchTemplate),
    TemplateNotFound,
    VersionNotFound,
}

/// Storage backend for the registry
pub struct Storage {
    conn: ConnectionManager,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    pub async fn health_check(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        let json: Option<String> = self.conn.get(key).await?;

        json.map(|data| {
            serde_json::from_str(&data).with_context(|| format!("Failed to deserialize {}", key))
        })
        .transpose()
    }

    async fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize {}", key))?;
        let _: () = self.conn.set(key, json).await?;
        Ok(())
    }

    /// Store `value` under `key` unless the key exists; index `id` on success
    async fn insert_json<T: Serialize>(
        &mut self,
        key: &str,
        index: &str,
        id: &str,
        value: &T,
    ) -> Result<bool> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize {}", key))?;

        let created: bool = self.conn.set_nx(key, json).await?;
        if created {
            let _: () = self.conn.sadd(index, id).await?;
        }
        Ok(created)
    }

    async fn list_json<T, F>(&mut self, index: &str, key_for: F) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> String,
    {
        let ids: Vec<String> = self.conn.smembers(index).await?;

        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = self.get_json(&key_for(&id)).await? {
                values.push(value);
            }
        }
        Ok(values)
    }

    // Images

    /// Register a new image.
    /// Returns Ok(false) if an image with the same id already exists
    pub async fn register_image(&mut self, region: &str, image: &Image) -> Result<bool> {
        let created = self
            .insert_json(
                &image_key(region, &image.id),
                &images_index(region),
                &image.id,
                image,
            )
            .await?;

        if created {
            info!("Registered image {} in {}", image.id, region);
        } else {
            debug!("Image already exists: {}", image.id);
        }
        Ok(created)
    }

    pub async fn get_image(&mut self, region: &str, id: &str) -> Result<Option<Image>> {
        self.get_json(&image_key(region, id)).await
    }

    /// List images matching the filter, oldest first
    pub async fn list_images(&mut self, region: &str, filter: &ImageFilter) -> Result<Vec<Image>> {
        let mut images: Vec<Image> = self
            .list_json(&images_index(region), |id| image_key(region, id))
            .await?;

        images.retain(|image| filter.matches(image));
        promotion_common::sort_by_creation(&mut images);
        Ok(images)
    }

    /// Merge tags into an image. Returns None if the image does not exist
    pub async fn set_image_tags(
        &mut self,
        region: &str,
        id: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<Option<Image>> {
        let Some(mut image) = self.get_image(region, id).await? else {
            return Ok(None);
        };

        image.tags.extend(tags);
        self.put_json(&image_key(region, id), &image).await?;

        debug!("Updated tags on image {}", id);
        Ok(Some(image))
    }

    pub async fn set_image_state(
        &mut self,
        region: &str,
        id: &str,
        state: ImageState,
    ) -> Result<Option<Image>> {
        let Some(mut image) = self.get_image(region, id).await? else {
            return Ok(None);
        };

        image.state = state;
        self.put_json(&image_key(region, id), &image).await?;

        info!("Image {} is now {}", id, state);
        Ok(Some(image))
    }

    // Launch templates

    pub async fn register_template(&mut self, region: &str, template: &LaunchTemplate) -> Result<bool> {
        let created = self
            .insert_json(
                &template_key(region, &template.id),
                &templates_index(region),
                &template.id,
                template,
            )
            .await?;

        if created {
            info!("Registered launch template {} in {}", template.id, region);
        }
        Ok(created)
    }

    pub async fn get_template(&mut self, region: &str, id: &str) -> Result<Option<LaunchTemplate>> {
        self.get_json(&template_key(region, id)).await
    }

    pub async fn list_templates(
        &mut self,
        region: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<LaunchTemplate>> {
        let mut templates: Vec<LaunchTemplate> = self
            .list_json(&templates_index(region), |id| template_key(region, id))
            .await?;

        templates.retain(|t| tags_match(tags, &t.tags));
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(templates)
    }

    /// Append a version to a template. Version writes for one environment
    /// are serialized by the promotion lease.
    pub async fn create_template_version(
        &mut self,
        region: &str,
        id: &str,
        request: CreateVersionRequest,
    ) -> Result<Option<TemplateVersion>> {
        let Some(mut template) = self.get_template(region, id).await? else {
            return Ok(None);
        };

        let before = template.versions.len();
        let version = template.push_version(request);

        if template.versions.len() > before {
            self.put_json(&template_key(region, id), &template).await?;
            info!(
                "Created version {} of launch template {} (image {})",
                version.number, id, version.image_id
            );
        } else {
            info!(
                "Client token already used, returning version {} of launch template {}",
                version.number, id
            );
        }

        Ok(Some(version))
    }

    pub async fn set_default_version(
        &mut self,
        region: &str,
        id: &str,
        version: u32,
    ) -> Result<DefaultVersionUpdate> {
        let Some(mut template) = self.get_template(region, id).await? else {
            return Ok(DefaultVersionUpdate::TemplateNotFound);
        };

        if template.version(version).is_none() {
            return Ok(DefaultVersionUpdate::VersionNotFound);
        }

        template.default_version = Some(version);
        self.put_json(&template_key(region, id), &template).await?;

        info!("Launch template {} default version is now {}", id, version);
        Ok(DefaultVersionUpdate::Updated(template))
    }

    // Fleet groups

    pub async fn register_fleet(&mut self, region: &str, fleet: &FleetGroup) -> Result<bool> {
        let created = self
            .insert_json(
                &fleet_key(region, &fleet.id),
                &fleets_index(region),
                &fleet.id,
                fleet,
            )
            .await?;

        if created {
            info!("Registered fleet group {} in {}", fleet.id, region);
        }
        Ok(created)
    }

    pub async fn list_fleets(
        &mut self,
        region: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Vec<FleetGroup>> {
        let mut fleets: Vec<FleetGroup> = self
            .list_json(&fleets_index(region), |id| fleet_key(region, id))
            .await?;

        fleets.retain(|f| tags_match(tags, &f.tags));
        fleets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(fleets)
    }

    /// Record a new instance refresh for a fleet group.
    /// Returns None if the fleet group does not exist
    pub async fn start_instance_refresh(
        &mut self,
        region: &str,
        fleet_id: &str,
        preferences: RefreshPreferences,
    ) -> Result<Option<InstanceRefresh>> {
        let fleet: Option<FleetGroup> = self.get_json(&fleet_key(region, fleet_id)).await?;
        if fleet.is_none() {
            return Ok(None);
        }

        let refresh = InstanceRefresh {
            id: uuid::Uuid::new_v4().to_string(),
            fleet_id: fleet_id.to_string(),
            preferences,
            status: RefreshStatus::Pending,
            percentage_complete: 0,
            started_at: Utc::now(),
        };

        self.put_json(&refresh_key(region, fleet_id, &refresh.id), &refresh)
            .await?;

        info!("Started instance refresh {} on {}", refresh.id, fleet_id);
        Ok(Some(refresh))
    }

    pub async fn get_instance_refresh(
        &mut self,
        region: &str,
        fleet_id: &str,
        refresh_id: &str,
    ) -> Result<Option<InstanceRefresh>> {
        self.get_json(&refresh_key(region, fleet_id, refresh_id)).await
    }

    /// Record refresh progress. Returns None if the refresh does not exist.
    pub async fn update_instance_refresh(
        &mut self,
        region: &str,
        fleet_id: &str,
        refresh_id: &str,
        update: &UpdateRefreshRequest,
    ) -> Result<Option<InstanceRefresh>> {
        let key = refresh_key(region, fleet_id, refresh_id);
        let Some(mut refresh) = self.get_json::<InstanceRefresh>(&key).await? else {
            return Ok(None);
        };

        update.apply(&mut refresh).map_err(|e| anyhow::anyhow!(e))?;
        self.put_json(&key, &refresh).await?;

        debug!(
            "Refresh {} on {} is {:?} at {}%",
            refresh_id, fleet_id, refresh.status, refresh.percentage_complete
        );
        Ok(Some(refresh))
    }

    // Production pointers

    pub async fn get_pointer(
        &mut self,
        region: &str,
        environment: Environment,
    ) -> Result<Option<ProductionPointer>> {
        self.get_json(&pointer_key(region, environment)).await
    }

    pub async fn set_pointer(&mut self, region: &str, pointer: &ProductionPointer) -> Result<()> {
        self.put_json(&pointer_key(region, pointer.environment), pointer)
            .await?;

        info!(
            "Production pointer for {} now targets {}",
            pointer.environment, pointer.image_id
        );
        Ok(())
    }

    // Leases

    /// Take the environment lease. Re-acquiring a lease already owned by
    /// `holder` extends it.
    pub async fn acquire_lease(
        &mut self,
        region: &str,
        environment: Environment,
        holder: &str,
        ttl_secs: u64,
    ) -> Result<LeaseGrant> {
        anyhow::ensure!(
            (1..=MAX_LEASE_TTL_SECS).contains(&ttl_secs),
            "Lease TTL out of range: {}s",
            ttl_secs
        );
        let key = lease_key(region, environment);
        let ttl_ms = ttl_secs * 1000;

        loop {
            let set: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(holder)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut self.conn)
                .await?;

            if set.is_some() {
                debug!("Lease {} acquired by {}", key, holder);
                return Ok(LeaseGrant::Acquired);
            }

            let current: Option<String> = self.conn.get(&key).await?;
            match current {
                Some(owner) if owner == holder => {
                    let _: i64 = redis::cmd("PEXPIRE")
                        .arg(&key)
                        .arg(ttl_ms)
                        .query_async(&mut self.conn)
                        .await?;
                    return Ok(LeaseGrant::Acquired);
                }
                Some(owner) => return Ok(LeaseGrant::Held { holder: owner }),
                // Expired between the two calls, try again
                None => continue,
            }
        }
    }

    /// Release the lease if `holder` still owns it
    pub async fn release_lease(
        &mut self,
        region: &str,
        environment: Environment,
        holder: &str,
    ) -> Result<bool> {
        let key = lease_key(region, environment);

        let deleted: i64 = redis::Script::new(RELEASE_LEASE_SCRIPT)
            .key(&key)
            .arg(holder)
            .invoke_async(&mut self.conn)
            .await?;

        debug!("Lease {} released by {}: {}", key, holder, deleted == 1);
        Ok(deleted == 1)
    }
}
