//! Launch-template promotion and fleet instance refresh.

use promotion_common::{
    tags, CreateVersionRequest, Environment, Error, FleetGroup, LaunchTemplate,
    RefreshPreferences, Result,
};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::backend::{FleetApi, LaunchTemplateApi};

/// Outcome of promoting an image into the environment's launch template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePromotion {
    Promoted { template_id: String, version: u32 },
    NoTemplate,
}

/// Outcome of asking the fleet to replace its instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetRefresh {
    Started { fleet_id: String, refresh_id: String },
    NoFleet,
}

fn environment_tags(environment: Environment) -> BTreeMap<String, String> {
    let mut filter = BTreeMap::new();
    filter.insert(tags::ENVIRONMENT.to_string(), environment.as_str().to_string());
    filter
}

/// The launch template tagged with the environment, if any
pub async fn find_template<T>(api: &T, environment: Environment) -> Result<Option<LaunchTemplate>>
where
    T: LaunchTemplateApi + ?Sized,
{
    let mut templates = api.find_templates(&environment_tags(environment)).await?;
    match templates.len() {
        0 => Ok(None),
        1 => Ok(templates.pop()),
        _ => Err(Error::AmbiguousTemplate(environment)),
    }
}

/// The fleet group tagged with the environment, if any
pub async fn find_fleet<F>(api: &F, environment: Environment) -> Result<Option<FleetGroup>>
where
    F: FleetApi + ?Sized,
{
    let mut fleets = api.find_fleets(&environment_tags(environment)).await?;
    match fleets.len() {
        0 => Ok(None),
        1 => Ok(fleets.pop()),
        _ => Err(Error::AmbiguousFleet(environment)),
    }
}

/// Create a template version launching `image_id` and make it the default
pub async fn promote_template<T>(
    api: &T,
    environment: Environment,
    image_id: &str,
    description: &str,
    client_token: &str,
) -> Result<TemplatePromotion>
where
    T: LaunchTemplateApi + ?Sized,
{
    let Some(template) = find_template(api, environment).await? else {
        warn!(
            "No launch template tagged Environment={}, skipping template update",
            environment
        );
        return Ok(TemplatePromotion::NoTemplate);
    };

    let version = api
        .create_version(
            &template.id,
            CreateVersionRequest {
                image_id: image_id.to_string(),
                description: description.to_string(),
                client_token: Some(client_token.to_string()),
            },
        )
        .await?;
    info!(
        "Created launch template {} version {}",
        template.id, version.number
    );

    api.set_default_version(&template.id, version.number).await?;
    info!(
        "Launch template {} default version set to {}",
        template.id, version.number
    );

    Ok(TemplatePromotion::Promoted {
        template_id: template.id,
        version: version.number,
    })
}

/// Start an instance refresh on the environment's fleet group. The refresh
/// is not awaited.
pub async fn refresh_fleet<F>(
    api: &F,
    environment: Environment,
    preferences: &RefreshPreferences,
) -> Result<FleetRefresh>
where
    F: FleetApi + ?Sized,
{
    let Some(fleet) = find_fleet(api, environment).await? else {
        warn!(
            "No fleet group tagged Environment={}, skipping instance refresh",
            environment
        );
        return Ok(FleetRefresh::NoFleet);
    };

    let refresh = api.start_instance_refresh(&fleet.id, preferences).await?;
    info!("Started instance refresh {} on {}", refresh.id, fleet.id);

    Ok(FleetRefresh::Started {
        fleet_id: fleet.id,
        refresh_id: refresh.id,
    })
}
