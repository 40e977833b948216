//! HTTP control plane.

pub mod error;
mod health;
mod ports;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;

pub use ports::{ActivationRequest, ActivationResponse, SetGroupRequest};

/// Create the control plane router with all routes and middleware.
pub fn create_router(engine: Engine) -> Router {
    Router::new()
        // Health endpoints
        .merge(health::routes())
        // Routing state
        .merge(ports::routes())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}
