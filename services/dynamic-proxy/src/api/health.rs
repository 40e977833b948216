//! Health check endpoints.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::engine::Engine;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,
}

/// Create health check routes.
pub fn routes() -> Router<Engine> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

/// Basic health check - is the service running?
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "dynamic-proxy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Liveness check for orchestrators; empty 200.
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
