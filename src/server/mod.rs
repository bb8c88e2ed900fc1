pub mod health;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::daemon::orchestrator::Orchestrator;
use crate::daemon::registry::JobRegistry;
use crate::daemon::supervisor::Supervisor;
use crate::models::ServerConfig;

/// Shared application state for the Axum server.
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<ServerConfig>,
    pub start_time: Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/jobs", get(routes::list_jobs))
        .route("/api/jobs/batch", post(routes::start_batch))
        .route(
            "/api/jobs/{id}",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/api/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/api/jobs/{id}/stream", get(sse::stream_job))
        .route("/api/site-rules/lookup", get(routes::lookup_site))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
