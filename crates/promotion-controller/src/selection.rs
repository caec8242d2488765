//! Image selection for deploy and rollback.
//!
//! Selection is a fresh registry query plus a total order on
//! `(creation_date, id)`. Nothing is cached between invocations.

use promotion_common::{
    sort_by_creation, tags, Environment, Error, Image, ImageFilter, ImageState, Result,
};
use tracing::{info, warn};

use crate::backend::{ControlPlane, ImageRegistry};

/// Where the current production image was resolved from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentSource {
    Pointer,
    ProductionTag,
}

/// Resolved images for a rollback
#[derive(Debug, Clone)]
pub struct RollbackSelection {
    pub current: Image,
    pub current_source: CurrentSource,
    pub target: Image,
}

/// Available images of an environment, oldest first
pub async fn available_images<R>(registry: &R, environment: Environment) -> Result<Vec<Image>>
where
    R: ImageRegistry + ?Sized,
{
    let filter = ImageFilter::for_environment(environment).state(ImageState::Available);
    let mut images = registry.list_images(&filter).await?;
    sort_by_creation(&mut images);
    Ok(images)
}

/// Fetch an explicitly named image and check it can be deployed
async fn explicit_image<R>(registry: &R, environment: Environment, id: &str) -> Result<Image>
where
    R: ImageRegistry + ?Sized,
{
    let image = registry
        .get_image(id)
        .await?
        .ok_or_else(|| Error::NoImageFound(format!("image {} does not exist", id)))?;

    image.ensure_available()?;

    if image.environment() != Some(environment) {
        warn!(
            "Image {} is tagged Environment={} but is being promoted to {}",
            image.id,
            image.tag(tags::ENVIRONMENT).unwrap_or("<none>"),
            environment
        );
    }

    Ok(image)
}

/// Pick the image to deploy: the explicit one, or the most recent
/// available image of the environment.
pub async fn select_deploy_target<R>(
    registry: &R,
    environment: Environment,
    explicit_id: Option<&str>,
) -> Result<Image>
where
    R: ImageRegistry + ?Sized,
{
    if let Some(id) = explicit_id {
        return explicit_image(registry, environment, id).await;
    }

    available_images(registry, environment)
        .await?
        .pop()
        .ok_or_else(|| {
            Error::NoImageFound(format!("no available image tagged Environment={}", environment))
        })
}

/// Resolve the live image of an environment: the production pointer when
/// it names an existing image, otherwise the newest `Production=true` image.
pub async fn resolve_current<C>(cloud: &C, environment: Environment) -> Result<(Image, CurrentSource)>
where
    C: ImageRegistry + ControlPlane + ?Sized,
{
    if let Some(pointer) = cloud.get_pointer(environment).await? {
        match cloud.get_image(&pointer.image_id).await? {
            Some(image) => return Ok((image, CurrentSource::Pointer)),
            None => warn!(
                "Production pointer for {} names missing image {}, falling back to tags",
                environment, pointer.image_id
            ),
        }
    }

    let filter = ImageFilter::for_environment(environment).tag(tags::PRODUCTION, tags::TRUE);
    let mut flagged = cloud.list_images(&filter).await?;
    sort_by_creation(&mut flagged);

    if flagged.len() > 1 {
        warn!(
            "{} images in {} carry Production=true, using the newest",
            flagged.len(),
            environment
        );
    }

    flagged
        .pop()
        .map(|image| (image, CurrentSource::ProductionTag))
        .ok_or(Error::NoCurrentImage(environment))
}

/// Pick the current image and the image to roll back to
pub async fn select_rollback_target<C>(
    cloud: &C,
    environment: Environment,
    explicit_id: Option<&str>,
) -> Result<RollbackSelection>
where
    C: ImageRegistry + ControlPlane + ?Sized,
{
    let (current, current_source) = resolve_current(cloud, environment).await?;
    info!("Current {} image: {} ({:?})", environment, current.id, current_source);

    let target = match explicit_id {
        Some(id) => explicit_image(cloud, environment, id).await?,
        None => {
            let mut images = available_images(cloud, environment).await?;
            if images.len() < 2 {
                return Err(Error::NoPreviousImage(environment));
            }
            images.pop();
            images.pop().ok_or(Error::NoPreviousImage(environment))?
        }
    };

    if target.id == current.id {
        return Err(Error::InvalidRollbackTarget(format!(
            "{} is already the current {} image",
            target.id, environment
        )));
    }

    target.ensure_available()?;

    Ok(RollbackSelection {
        current,
        current_source,
        target,
    })
}
