//! HTTP Server for Health and Metrics Endpoints
//!
//! Both endpoints are plain reads of hub state.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use crate::hub::RelayHub;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub hub: Arc<RelayHub>,
}

/// Creates the HTTP router with health and metrics endpoints.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "healer-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics"]
    }))
}

/// Liveness, connected peers and queue depth.
async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.hub.health())
}

/// Health plus per-peer last-seen times, queue ids and counters.
async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.hub.metrics())
}
