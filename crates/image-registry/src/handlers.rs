//! API request handlers for the registry

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use promotion_common::{
    CreateVersionRequest, Environment, FleetGroup, Image, ImageFilter, InstanceRefresh,
    LaunchTemplate, LeaseGrant, ProductionPointer, RefreshPreferences, TemplateVersion,
    MAX_LEASE_TTL_SECS,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    models::{
        AcquireLeaseRequest, FleetsListResponse, ImagesListResponse, RefreshResponse,
        RegisterFleetRequest, RegisterImageRequest, RegisterTemplateRequest, ReleaseLeaseQuery,
        ReleaseLeaseResponse, SetDefaultVersionRequest, SetStateRequest, SetTagsRequest,
        TemplatesListResponse, UpdateRefreshRequest,
    },
    storage::{DefaultVersionUpdate, Storage},
};

/// Shared application state
pub struct AppState {
    pub storage: Mutex<Storage>,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn conflict(message: String) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{:#}", err),
        }
    }
}

fn parse_environment(raw: &str) -> Result<Environment, ApiError> {
    raw.parse()
        .map_err(|e: promotion_common::Error| ApiError::bad_request(e.to_string()))
}

fn check_lease_ttl(ttl_secs: u64) -> Result<(), ApiError> {
    if ttl_secs == 0 || ttl_secs > MAX_LEASE_TTL_SECS {
        return Err(ApiError::bad_request(format!(
            "ttl_secs must be between 1 and {}",
            MAX_LEASE_TTL_SECS
        )));
    }
    Ok(())
}

/// Collect `tag.<Key>=<Value>` query parameters
fn tag_filter(params: &HashMap<String, String>) -> Result<BTreeMap<String, String>, ApiError> {
    ImageFilter::from_query_pairs(params.iter())
        .map(|filter| filter.tags)
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "image-registry"
    }))
}

// Images

/// Register an image produced by the build backend
pub async fn register_image_handler(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
    Json(payload): Json<RegisterImageRequest>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    let image = payload.into_image();
    info!("Registering image {} in {}", image.id, region);

    let mut storage = state.storage.lock().await;
    if storage.register_image(&region, &image).await? {
        Ok((StatusCode::CREATED, Json(image)))
    } else {
        Err(ApiError::conflict(format!("Image already exists: {}", image.id)))
    }
}

/// List images by tag and state filter, oldest first
pub async fn list_images_handler(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<ImagesListResponse>, ApiError> {
    let filter = ImageFilter::from_query_pairs(params.iter())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let mut storage = state.storage.lock().await;
    let images = storage.list_images(&region, &filter).await?;
    let total = images.len();

    Ok(Json(ImagesListResponse { images, total }))
}

pub async fn get_image_handler(
    State(state): State<Arc<AppState>>,
    Path((region, id)): Path<(String, String)>,
) -> Result<Json<Image>, ApiError> {
    let mut storage = state.storage.lock().await;

    match storage.get_image(&region, &id).await? {
        Some(image) => Ok(Json(image)),
        None => Err(ApiError::not_found(format!("Image not found: {}", id))),
    }
}

/// Merge tags into an image
pub async fn set_image_tags_handler(
    State(state): State<Arc<AppState>>,
    Path((region, id)): Path<(String, String)>,
    Json(payload): Json<SetTagsRequest>,
) -> Result<Json<Image>, ApiError> {
    info!("Tagging image {} in {}: {:?}", id, region, payload.tags);

    let mut storage = state.storage.lock().await;
    match storage.set_image_tags(&region, &id, payload.tags).await? {
        Some(image) => Ok(Json(image)),
        None => Err(ApiError::not_found(format!("Image not found: {}", id))),
    }
}

/// Lifecycle transitions are driven by the build backend
pub async fn set_image_state_handler(
    State(state): State<Arc<AppState>>,
    Path((region, id)): Path<(String, String)>,
    Json(payload): Json<SetStateRequest>,
) -> Result<Json<Image>, ApiError> {
    let mut storage = state.storage.lock().await;

    match storage.set_image_state(&region, &id, payload.state).await? {
        Some(image) => Ok(Json(image)),
        None => Err(ApiError::not_found(format!("Image not found: {}", id))),
    }
}

// Launch templates

pub async fn register_template_handler(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
    Json(payload): Json<RegisterTemplateRequest>,
) -> Result<(StatusCode, Json<LaunchTemplate>), ApiError> {
    let template = payload.into_template();

    let mut storage = state.storage.lock().await;
    if storage.register_template(&region, &template).await? {
        Ok((StatusCode::CREATED, Json(template)))
    } else {
        Err(ApiError::conflict(format!(
            "Launch template already exists: {}",
            template.id
        )))
    }
}

pub async fn list_templates_handler(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<TemplatesListResponse>, ApiError> {
    let tags = tag_filter(&params)?;

    let mut storage = state.storage.lock().await;
    let templates = storage.list_templates(&region, &tags).await?;
    let total = templates.len();

    Ok(Json(TemplatesListResponse { templates, total }))
}

pub async fn get_template_handler(
    State(state): State<Arc<AppState>>,
    Path((region, id)): Path<(String, String)>,
) -> Result<Json<LaunchTemplate>, ApiError> {
    let mut storage = state.storage.lock().await;

    match storage.get_template(&region, &id).await? {
        Some(template) => Ok(Json(template)),
        None => Err(ApiError::not_found(format!("Launch template not found: {}", id))),
    }
}

/// Create a template version; idempotent per client token
pub async fn create_version_handler(
    State(state): State<Arc<AppState>>,
    Path((region, id)): Path<(String, String)>,
    Json(payload): Json<CreateVersionRequest>,
) -> Result<Json<TemplateVersion>, ApiError> {
    info!(
        "Creating version of launch template {} for image {}",
        id, payload.image_id
    );

    let mut storage = state.storage.lock().await;
    match storage.create_template_version(&region, &id, payload).await? {
        Some(version) => Ok(Json(version)),
        None => Err(ApiError::not_found(format!("Launch template not found: {}", id))),
    }
}

pub async fn set_default_version_handler(
    State(state): State<Arc<AppState>>,
    Path((region, id)): Path<(String, String)>,
    Json(payload): Json<SetDefaultVersionRequest>,
) -> Result<Json<LaunchTemplate>, ApiError> {
    let mut storage = state.storage.lock().await;

    match storage
        .set_default_version(&region, &id, payload.version)
        .await?
    {
        DefaultVersionUpdate::Updated(template) => Ok(Json(template)),
        DefaultVersionUpdate::TemplateNotFound => Err(ApiError::not_found(format!(
            "Launch template not found: {}",
            id
        ))),
        DefaultVersionUpdate::VersionNotFound => Err(ApiError::bad_request(format!(
            "Launch template {} has no version {}",
            id, payload.version
        ))),
    }
}

// Fleet groups

pub async fn register_fleet_handler(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
    Json(payload): Json<RegisterFleetRequest>,
) -> Result<(StatusCode, Json<FleetGroup>), ApiError> {
    let fleet = payload.into_fleet();

    let mut storage = state.storage.lock().await;
    if storage.register_fleet(&region, &fleet).await? {
        Ok((StatusCode::CREATED, Json(fleet)))
    } else {
        Err(ApiError::conflict(format!(
            "Fleet group already exists: {}",
            fleet.id
        )))
    }
}

pub async fn list_fleets_handler(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<FleetsListResponse>, ApiError> {
    let tags = tag_filter(&params)?;

    let mut storage = state.storage.lock().await;
    let fleets = storage.list_fleets(&region, &tags).await?;
    let total = fleets.len();

    Ok(Json(FleetsListResponse { fleets, total }))
}

pub async fn start_refresh_handler(
    State(state): State<Arc<AppState>>,
    Path((region, fleet_id)): Path<(String, String)>,
    Json(preferences): Json<RefreshPreferences>,
) -> Result<Json<RefreshResponse>, ApiError> {
    info!("Starting instance refresh on {} in {}", fleet_id, region);

    let mut storage = state.storage.lock().await;
    match storage
        .start_instance_refresh(&region, &fleet_id, preferences)
        .await?
    {
        Some(refresh) => Ok(Json(RefreshResponse { refresh })),
        None => Err(ApiError::not_found(format!(
            "Fleet group not found: {}",
            fleet_id
        ))),
    }
}

pub async fn get_refresh_handler(
    State(state): State<Arc<AppState>>,
    Path((region, fleet_id, refresh_id)): Path<(String, String, String)>,
) -> Result<Json<InstanceRefresh>, ApiError> {
    let mut storage = state.storage.lock().await;

    match storage
        .get_instance_refresh(&region, &fleet_id, &refresh_id)
        .await?
    {
        Some(refresh) => Ok(Json(refresh)),
        None => Err(ApiError::not_found(format!(
            "Instance refresh not found: {}",
            refresh_id
        ))),
    }
}

/// Report refresh progress. Refreshes stay `pending` until something
/// driving the fleet reports here.
pub async fn update_refresh_handler(
    State(state): State<Arc<AppState>>,
    Path((region, fleet_id, refresh_id)): Path<(String, String, String)>,
    Json(payload): Json<UpdateRefreshRequest>,
) -> Result<Json<InstanceRefresh>, ApiError> {
    if let Some(percentage) = payload.percentage_complete.filter(|p| *p > 100) {
        return Err(ApiError::bad_request(format!(
            "percentage_complete must be at most 100, got {}",
            percentage
        )));
    }

    let mut storage = state.storage.lock().await;
    match storage
        .update_instance_refresh(&region, &fleet_id, &refresh_id, &payload)
        .await?
    {
        Some(refresh) => Ok(Json(refresh)),
        None => Err(ApiError::not_found(format!(
            "Instance refresh not found: {}",
            refresh_id
        ))),
    }
}

// Production pointers

pub async fn get_pointer_handler(
    State(state): State<Arc<AppState>>,
    Path((region, environment)): Path<(String, String)>,
) -> Result<Json<ProductionPointer>, ApiError> {
    let environment = parse_environment(&environment)?;

    let mut storage = state.storage.lock().await;
    match storage.get_pointer(&region, environment).await? {
        Some(pointer) => Ok(Json(pointer)),
        None => Err(ApiError::not_found(format!(
            "No production pointer for {}",
            environment
        ))),
    }
}

pub async fn set_pointer_handler(
    State(state): State<Arc<AppState>>,
    Path((region, environment)): Path<(String, String)>,
    Json(pointer): Json<ProductionPointer>,
) -> Result<Json<ProductionPointer>, ApiError> {
    let environment = parse_environment(&environment)?;
    if pointer.environment != environment {
        return Err(ApiError::bad_request(format!(
            "Pointer environment {} does not match path {}",
            pointer.environment, environment
        )));
    }

    let mut storage = state.storage.lock().await;
    storage.set_pointer(&region, &pointer).await?;

    Ok(Json(pointer))
}

// Leases

pub async fn acquire_lease_handler(
    State(state): State<Arc<AppState>>,
    Path((region, environment)): Path<(String, String)>,
    Json(payload): Json<AcquireLeaseRequest>,
) -> Result<Json<LeaseGrant>, ApiError> {
    let environment = parse_environment(&environment)?;
    check_lease_ttl(payload.ttl_secs)?;

    let mut storage = state.storage.lock().await;
    let grant = storage
        .acquire_lease(&region, environment, &payload.holder, payload.ttl_secs)
        .await?;

    Ok(Json(grant))
}

pub async fn release_lease_handler(
    State(state): State<Arc<AppState>>,
    Path((region, environment)): Path<(String, String)>,
    Query(query): Query<ReleaseLeaseQuery>,
) -> Result<Json<ReleaseLeaseResponse>, ApiError> {
    let environment = parse_environment(&environment)?;

    let mut storage = state.storage.lock().await;
    let released = storage
        .release_lease(&region, environment, &query.holder)
        .await?;

    Ok(Json(ReleaseLeaseResponse { released }))
}
