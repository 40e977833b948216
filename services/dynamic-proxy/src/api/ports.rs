//! Port and group endpoints.
//!
//! Every route is scoped to a listening port:
//! /ports/{port}/...

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::engine::Engine;
use crate::proxy::{GroupTable, ListenerStatsSnapshot};

/// Create port routes.
pub fn routes() -> Router<Engine> {
    Router::new()
        .route("/ports", get(list_ports))
        .route("/ports/{port}/groups", get(get_groups).post(set_group))
        .route("/ports/{port}/group/{group}", delete(delete_group))
        .route("/ports/{port}/activate", post(activate))
        .route("/ports/{port}/stats", get(get_stats))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize, Serialize)]
pub struct SetGroupRequest {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<String>,
    /// Zero leaves an existing group's weight unchanged.
    #[serde(default)]
    pub weight: f64,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ActivationRequest {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub weights: Vec<f64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ActivationResponse {
    pub port: u16,
    pub generation: u64,
}

#[derive(Debug, Serialize)]
pub struct PortStatsResponse {
    pub port: u16,
    pub generation: u64,
    #[serde(flatten)]
    pub stats: ListenerStatsSnapshot,
}

// =============================================================================
// Handlers
// =============================================================================

/// Groups of every known port.
///
/// GET /ports
async fn list_ports(State(engine): State<Engine>) -> Json<BTreeMap<u16, GroupTable>> {
    let snapshot = engine.registry().snapshot().await;
    Json(
        snapshot
            .into_iter()
            .map(|(port, groups)| (port, GroupTable::clone(&groups)))
            .collect(),
    )
}

/// Groups of one port; an unknown port has no groups.
///
/// GET /ports/{port}/groups
async fn get_groups(
    State(engine): State<Engine>,
    Path(port): Path<String>,
) -> Result<Json<GroupTable>, ApiError> {
    let port = parse_port(&port)?;
    let groups = engine
        .registry()
        .groups(port)
        .await
        .map(|groups| GroupTable::clone(&groups))
        .unwrap_or_default();

    Ok(Json(groups))
}

/// Insert or update a group.
///
/// POST /ports/{port}/groups
async fn set_group(
    State(engine): State<Engine>,
    Path(port): Path<String>,
    body: Result<Json<SetGroupRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let port = parse_port(&port)?;
    let Json(req) = body?;

    if req.name.is_empty() {
        return Err(ApiError::unprocessable("invalid_name", "group name is required"));
    }
    validate_weight("weight", req.weight)?;

    engine
        .registry()
        .set_group_servers(port, &req.name, req.servers, req.weight)
        .await;

    Ok(StatusCode::OK)
}

/// Remove a group.
///
/// DELETE /ports/{port}/group/{group}
async fn delete_group(
    State(engine): State<Engine>,
    Path((port, group)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let port = parse_port(&port)?;
    engine.registry().delete_group(port, &group).await;
    Ok(StatusCode::OK)
}

/// Set the active groups and drain every connection of the previous generation.
///
/// POST /ports/{port}/activate
async fn activate(
    State(engine): State<Engine>,
    Path(port): Path<String>,
    body: Result<Json<ActivationRequest>, JsonRejection>,
) -> Result<Json<ActivationResponse>, ApiError> {
    let port = parse_port(&port)?;
    let Json(req) = body?;

    for (i, weight) in req.weights.iter().enumerate() {
        validate_weight(&format!("weights[{i}]"), *weight)?;
    }

    let generation = engine.activate(port, &req.groups, &req.weights).await;

    Ok(Json(ActivationResponse { port, generation }))
}

/// Listener statistics of a registered port.
///
/// GET /ports/{port}/stats
async fn get_stats(
    State(engine): State<Engine>,
    Path(port): Path<String>,
) -> Result<Json<PortStatsResponse>, ApiError> {
    let port = parse_port(&port)?;
    let stats = engine.stats(port).await.ok_or_else(|| {
        ApiError::not_found("unknown_port", format!("port {port} is not a listening port"))
    })?;
    let generation = engine.drains().generation(port).await.unwrap_or_default();

    Ok(Json(PortStatsResponse {
        port,
        generation,
        stats: stats.snapshot(),
    }))
}

// =============================================================================
// Validation
// =============================================================================

fn parse_port(raw: &str) -> Result<u16, ApiError> {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ApiError::bad_request(
            "invalid_port",
            format!("invalid port: {raw}"),
        )),
    }
}

fn validate_weight(field: &str, weight: f64) -> Result<(), ApiError> {
    if weight.is_finite() && weight >= 0.0 {
        return Ok(());
    }

    Err(ApiError::unprocessable(
        "invalid_weight",
        format!("{field} must be a non-negative number, got {weight}"),
    ))
}
