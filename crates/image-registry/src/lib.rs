//! Image Registry Service
//!
//! A self-hosted stand-in for the compute APIs consumed by the promotion
//! controller: golden images and their tags, launch templates with
//! versions, fleet groups with instance refreshes, plus the
//! per-environment production pointer and promotion lease. Every resource
//! is partitioned by region.

pub mod handlers;
pub mod models;
pub mod storage;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use handlers::AppState;
pub use storage::Storage;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        // Images
        .route(
            "/api/regions/{region}/images",
            post(handlers::register_image_handler).get(handlers::list_images_handler),
        )
        .route(
            "/api/regions/{region}/images/{id}",
            get(handlers::get_image_handler),
        )
        .route(
            "/api/regions/{region}/images/{id}/tags",
            put(handlers::set_image_tags_handler),
        )
        .route(
            "/api/regions/{region}/images/{id}/state",
            put(handlers::set_image_state_handler),
        )
        // Launch templates
        .route(
            "/api/regions/{region}/launch-templates",
            post(handlers::register_template_handler).get(handlers::list_templates_handler),
        )
        .route(
            "/api/regions/{region}/launch-templates/{id}",
            get(handlers::get_template_handler),
        )
        .route(
            "/api/regions/{region}/launch-templates/{id}/versions",
            post(handlers::create_version_handler),
        )
        .route(
            "/api/regions/{region}/launch-templates/{id}/default-version",
            put(handlers::set_default_version_handler),
        )
        // Fleet groups
        .route(
            "/api/regions/{region}/fleet-groups",
            post(handlers::register_fleet_handler).get(handlers::list_fleets_handler),
        )
        .route(
            "/api/regions/{region}/fleet-groups/{id}/instance-refreshes",
            post(handlers::start_refresh_handler),
        )
        .route(
            "/api/regions/{region}/fleet-groups/{id}/instance-refreshes/{refresh_id}",
            get(handlers::get_refresh_handler).put(handlers::update_refresh_handler),
        )
        // Pointers and leases
        .route(
            "/api/regions/{region}/pointers/{environment}",
            get(handlers::get_pointer_handler).put(handlers::set_pointer_handler),
        )
        .route(
            "/api/regions/{region}/leases/{environment}",
            post(handlers::acquire_lease_handler).delete(handlers::release_lease_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
