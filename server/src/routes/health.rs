//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub remote_configured: bool,
    pub active_subscriptions: usize,
    pub started_at: DateTime<Utc>,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        remote_configured: state.coordinator.remote_available(),
        active_subscriptions: state.notifier.active_subscriptions(),
        started_at: state.started_at,
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Tandem Sync Server"
}
