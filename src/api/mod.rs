//! HTTP API server for labvisor.
//!
//! Requests are authenticated upstream; the caller identity arrives in the
//! `x-user-id` and `x-user-role` headers.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! labvisor serve --listen 127.0.0.1:8080
//!
//! # Create a lab
//! curl -X POST http://localhost:8080/api/v1/labs \
//!   -H "Content-Type: application/json" -H "x-user-id: 42" \
//!   -d '{"name": "web", "challenge_id": 7, "vms": [{"name": "kali", "vm_type": "kali"}]}'
//! ```

pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;

use state::ApiState;

/// Upper bound on a single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// OpenAPI document of the API.
#[derive(OpenApi)]
#[openapi(
    info(title = "labvisor", description = "Ephemeral training lab orchestrator"),
    paths(
        handlers::health::health,
        handlers::labs::create_lab,
        handlers::labs::list_labs,
        handlers::labs::get_lab,
        handlers::labs::delete_lab,
        handlers::labs::extend_lab,
        handlers::labs::lab_access,
        handlers::labs::lab_status,
        handlers::labs::cleanup_expired,
        handlers::vms::update_vm,
    ),
    tags(
        (name = "Health", description = "Service health"),
        (name = "Labs", description = "Lab lifecycle"),
        (name = "VMs", description = "Virtual machine records")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>) -> Router {
    // Health check and API document
    let meta_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api-docs/openapi.json", get(openapi_json));

    // Lab routes
    let lab_routes = Router::new()
        .route(
            "/",
            post(handlers::labs::create_lab).get(handlers::labs::list_labs),
        )
        .route("/cleanup", post(handlers::labs::cleanup_expired))
        .route(
            "/:id",
            get(handlers::labs::get_lab).delete(handlers::labs::delete_lab),
        )
        .route("/:id/extend", post(handlers::labs::extend_lab))
        .route("/:id/access", get(handlers::labs::lab_access))
        .route("/:id/status", get(handlers::labs::lab_status))
        // VM routes
        .route("/:id/vms/:vm_id", put(handlers::vms::update_vm));

    // API v1 routes
    let api_v1 = Router::new().nest("/labs", lab_routes);

    // Combine all routes
    Router::new()
        .merge(meta_routes)
        .nest("/api/v1", api_v1)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
