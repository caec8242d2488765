//! The promotion protocol: select, gate, lock, promote, refresh, record.
//!
//! Every fatal selection or validation error is raised before the first
//! mutation. Once mutation starts, steps run in order and the first failure
//! aborts the rest; already-applied steps are not undone.

use chrono::{DateTime, Utc};
use promotion_common::{
    format_timestamp, tags, Environment, Error, FleetGroup, Image, InstanceRefresh,
    LaunchTemplate, LeaseGrant, ProductionPointer, RefreshPreferences, Result, RollbackRecord,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::backend::Cloud;
use crate::gate::{self, Console};
use crate::rollout::{self, FleetRefresh, TemplatePromotion};
use crate::selection::{self, CurrentSource};

/// Knobs for a controller instance
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Recorded on pointers and rollback records
    pub operator: String,

    pub lease_ttl: Duration,

    /// Set `Production=false` on the image superseded by a rollback
    pub clear_stale_production_flag: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            operator: "unknown".to_string(),
            lease_ttl: Duration::from_secs(900),
            clear_stale_production_flag: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub environment: Environment,
    pub image_id: String,
    pub template: TemplatePromotion,
    pub refresh: FleetRefresh,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DeployOutcome {
    /// Production confirmation was not given; nothing changed
    Declined,
    Deployed(DeployReport),
}

#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub environment: Environment,
    pub from_image_id: String,
    pub to_image_id: String,
    pub template: TemplatePromotion,
    pub refresh: FleetRefresh,
    pub record_path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum RollbackOutcome {
    /// Confirmation was not given; nothing changed
    Declined,
    RolledBack(RollbackReport),
}

/// Read-only snapshot of an environment
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub environment: Environment,
    pub pointer: Option<ProductionPointer>,
    pub current: Option<(Image, CurrentSource)>,
    pub latest_available: Option<Image>,
    pub template: Option<LaunchTemplate>,
    pub fleet: Option<FleetGroup>,
    pub refresh: Option<InstanceRefresh>,
}

fn describe_image(image: &Image) -> String {
    format!(
        "{} (created {}, state {})",
        image.id,
        format_timestamp(image.creation_date),
        image.state
    )
}

pub struct Controller {
    cloud: Arc<dyn Cloud>,
    audit: AuditLog,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(cloud: Arc<dyn Cloud>, audit: AuditLog, settings: ControllerSettings) -> Self {
        Self {
            cloud,
            audit,
            settings,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Take the environment lease for this invocation
    async fn lock(&self, environment: Environment, invocation: &str) -> Result<()> {
        match self
            .cloud
            .acquire_lease(environment, invocation, self.settings.lease_ttl)
            .await?
        {
            LeaseGrant::Acquired => {
                info!("Acquired {} promotion lease as {}", environment, invocation);
                Ok(())
            }
            LeaseGrant::Held { holder } => Err(Error::PromotionInProgress {
                environment,
                holder,
            }),
        }
    }

    /// Release the lease. Failure is logged only; the lease expires anyway.
    async fn unlock(&self, environment: Environment, invocation: &str) {
        match self.cloud.release_lease(environment, invocation).await {
            Ok(true) => info!("Released {} promotion lease", environment),
            Ok(false) => warn!(
                "{} promotion lease was no longer held by {}",
                environment, invocation
            ),
            Err(e) => warn!("Failed to release {} promotion lease: {}", environment, e),
        }
    }

    /// Deploy the explicit image, or the newest available one, to an
    /// environment. Production requires confirmation.
    pub async fn deploy(
        &self,
        environment: Environment,
        explicit_id: Option<&str>,
        console: &mut dyn Console,
    ) -> Result<DeployOutcome> {
        console.say(&format!("Deploying to {}", environment));

        let target = selection::select_deploy_target(&*self.cloud, environment, explicit_id).await?;
        console.say(&format!("Selected image: {}", describe_image(&target)));

        if environment.is_production() {
            console.say("WARNING: you are about to deploy to PRODUCTION");
            if !gate::confirm(console, "Type 'yes' to continue:")? {
                console.say("Deployment cancelled");
                return Ok(DeployOutcome::Declined);
            }
        }

        let invocation = Uuid::new_v4().to_string();
        self.lock(environment, &invocation).await?;
        let result = self
            .apply_deploy(environment, &target, &invocation, console)
            .await;
        self.unlock(environment, &invocation).await;

        result.map(DeployOutcome::Deployed)
    }

    async fn apply_deploy(
        &self,
        environment: Environment,
        target: &Image,
        invocation: &str,
        console: &mut dyn Console,
    ) -> Result<DeployReport> {
        let now = Utc::now();
        let ts = format_timestamp(now);

        let description = format!("Deployed AMI {} on {}", target.id, ts);
        let template =
            rollout::promote_template(&*self.cloud, environment, &target.id, &description, invocation)
                .await?;
        match &template {
            TemplatePromotion::Promoted { template_id, version } => console.say(&format!(
                "Launch template {} now defaults to version {}",
                template_id, version
            )),
            TemplatePromotion::NoTemplate => console.say(&format!(
                "WARNING: no launch template found for {}",
                environment
            )),
        }

        let refresh =
            rollout::refresh_fleet(&*self.cloud, environment, &RefreshPreferences::staged()).await?;
        Self::say_refresh(console, environment, &refresh);

        let mut deploy_tags = BTreeMap::new();
        deploy_tags.insert(tags::LAST_DEPLOYED.to_string(), ts);
        deploy_tags.insert(tags::DEPLOYED_TO.to_string(), environment.as_str().to_string());
        self.cloud.set_tags(&target.id, deploy_tags).await?;
        console.say(&format!("Tagged {} as deployed to {}", target.id, environment));

        let previous = self.cloud.get_pointer(environment).await?;
        self.cloud
            .set_pointer(&ProductionPointer {
                environment,
                image_id: target.id.clone(),
                previous_image_id: previous
                    .map(|p| p.image_id)
                    .filter(|id| id != &target.id),
                updated_at: now,
                updated_by: self.settings.operator.clone(),
            })
            .await?;

        info!("Deployed {} to {}", target.id, environment);
        Ok(DeployReport {
            environment,
            image_id: target.id.clone(),
            template,
            refresh,
            deployed_at: now,
        })
    }

    /// Roll an environment back to the explicit image, or to the image
    /// built before the newest one. Always requires a reason and
    /// confirmation.
    pub async fn rollback(
        &self,
        environment: Environment,
        explicit_id: Option<&str>,
        reason: Option<&str>,
        console: &mut dyn Console,
    ) -> Result<RollbackOutcome> {
        // A supplied reason is checked before anything else
        let supplied_reason = reason.map(gate::validate_reason).transpose()?;

        console.say(&format!("Rolling back {}", environment));

        let selection =
            selection::select_rollback_target(&*self.cloud, environment, explicit_id).await?;
        let source = match selection.current_source {
            CurrentSource::Pointer => "production pointer",
            CurrentSource::ProductionTag => "Production tag",
        };
        console.say(&format!(
            "Current image: {} [from {}]",
            describe_image(&selection.current),
            source
        ));
        console.say(&format!(
            "Rollback target: {}",
            describe_image(&selection.target)
        ));

        let reason = match supplied_reason {
            Some(reason) => reason,
            None => gate::obtain_reason(console, None)?,
        };

        if !gate::confirm(console, "Type 'yes' to roll back:")? {
            console.say("Rollback cancelled");
            return Ok(RollbackOutcome::Declined);
        }

        let invocation = Uuid::new_v4().to_string();
        self.lock(environment, &invocation).await?;
        let result = self
            .apply_rollback(
                environment,
                &selection.current,
                &selection.target,
                &reason,
                &invocation,
                console,
            )
            .await;
        self.unlock(environment, &invocation).await;

        result.map(RollbackOutcome::RolledBack)
    }

    async fn apply_rollback(
        &self,
        environment: Environment,
        current: &Image,
        target: &Image,
        reason: &str,
        invocation: &str,
        console: &mut dyn Console,
    ) -> Result<RollbackReport> {
        let now = Utc::now();
        let ts = format_timestamp(now);

        let description = format!("ROLLBACK: {}", reason);
        let template =
            rollout::promote_template(&*self.cloud, environment, &target.id, &description, invocation)
                .await?;
        match &template {
            TemplatePromotion::Promoted { template_id, version } => console.say(&format!(
                "Launch template {} rolled back to version {}",
                template_id, version
            )),
            TemplatePromotion::NoTemplate => console.say(&format!(
                "WARNING: no launch template found for {}",
                environment
            )),
        }

        let refresh =
            rollout::refresh_fleet(&*self.cloud, environment, &RefreshPreferences::single_pass())
                .await?;
        Self::say_refresh(console, environment, &refresh);

        let mut superseded = BTreeMap::new();
        superseded.insert(tags::STATUS.to_string(), tags::SUPERSEDED.to_string());
        superseded.insert(tags::SUPERSEDED_DATE.to_string(), ts.clone());
        superseded.insert(tags::ROLLBACK_REASON.to_string(), reason.to_string());
        if self.settings.clear_stale_production_flag {
            superseded.insert(tags::PRODUCTION.to_string(), tags::FALSE.to_string());
        }
        self.cloud.set_tags(&current.id, superseded).await?;
        console.say(&format!("Marked {} as superseded", current.id));

        let mut restored = BTreeMap::new();
        restored.insert(tags::PRODUCTION.to_string(), tags::TRUE.to_string());
        restored.insert(tags::ROLLED_BACK_DATE.to_string(), ts);
        restored.insert(tags::ROLLBACK_REASON.to_string(), reason.to_string());
        self.cloud.set_tags(&target.id, restored).await?;
        console.say(&format!("Marked {} as production", target.id));

        self.cloud
            .set_pointer(&ProductionPointer {
                environment,
                image_id: target.id.clone(),
                previous_image_id: Some(current.id.clone()),
                updated_at: now,
                updated_by: self.settings.operator.clone(),
            })
            .await?;

        let record = RollbackRecord {
            timestamp: now,
            environment,
            reason: reason.to_string(),
            from_image_id: current.id.clone(),
            to_image_id: target.id.clone(),
            initiated_by: self.settings.operator.clone(),
        };
        let record_path = self.audit.append(&record)?;
        console.say(&format!("Rollback record: {}", record_path.display()));

        info!(
            "Rolled back {} from {} to {}",
            environment, current.id, target.id
        );
        Ok(RollbackReport {
            environment,
            from_image_id: current.id.clone(),
            to_image_id: target.id.clone(),
            template,
            refresh,
            record_path,
        })
    }

    fn say_refresh(console: &mut dyn Console, environment: Environment, refresh: &FleetRefresh) {
        match refresh {
            FleetRefresh::Started { fleet_id, refresh_id } => console.say(&format!(
                "Instance refresh {} started on {}",
                refresh_id, fleet_id
            )),
            FleetRefresh::NoFleet => console.say(&format!(
                "WARNING: no fleet group found for {}",
                environment
            )),
        }
    }

    /// Gather what is currently live in an environment
    pub async fn status(
        &self,
        environment: Environment,
        refresh_id: Option<&str>,
    ) -> Result<StatusReport> {
        let pointer = self.cloud.get_pointer(environment).await?;

        let current = match selection::resolve_current(&*self.cloud, environment).await {
            Ok(resolved) => Some(resolved),
            Err(Error::NoCurrentImage(_)) => None,
            Err(e) => return Err(e),
        };

        let latest_available = selection::available_images(&*self.cloud, environment)
            .await?
            .pop();
        let template = rollout::find_template(&*self.cloud, environment).await?;
        let fleet = rollout::find_fleet(&*self.cloud, environment).await?;

        let refresh = match (&fleet, refresh_id) {
            (Some(fleet), Some(id)) => self.cloud.describe_instance_refresh(&fleet.id, id).await?,
            (None, Some(id)) => {
                warn!("Cannot look up refresh {}: no fleet group for {}", id, environment);
                None
            }
            _ => None,
        };

        Ok(StatusReport {
            environment,
            pointer,
            current,
            latest_available,
            template,
            fleet,
            refresh,
        })
    }

    /// Rollback records for an environment, oldest first
    pub fn history(&self, environment: Environment) -> Result<Vec<RollbackRecord>> {
        self.audit.list(environment)
    }
}
