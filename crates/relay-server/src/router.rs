use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use relay_engine::RelayCoordinator;

use crate::config::ServerConfig;
use crate::handler;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayCoordinator>,
    pub config: ServerConfig,
}

/// Build the axum router with all relay endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/status", get(handler::status_handler))
        .route("/v1/pause", post(handler::pause_handler))
        .route("/v1/resume", post(handler::resume_handler))
        .route("/v1/drain", post(handler::drain_handler))
        .route("/v1/records/:id/abandon", post(handler::abandon_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
