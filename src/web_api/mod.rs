//! WebAPI - REST API endpoints and the socket transport
//!
//! ## Responsibilities
//!
//! - HTTP API routes and session enforcement
//! - Request validation and response formatting
//! - Socket upgrade and per-client connection tasks

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine_ok = state.gate.engine_online().await;
    let snapshot = state.router.status_snapshot().await;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: snapshot.uptime,
        camera_ready: snapshot.camera_ready,
        engine_connected: engine_ok,
        cloud_ready: snapshot.cloud.ready,
    };

    Json(response)
}
