//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub name: String,
    pub version: String,
    pub mode: String,
}

/// Health check endpoint. Reports 503 once shutdown has started.
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let status = if state.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let mode = if state.delivery().is_broker() {
        "broker"
    } else {
        "cache"
    };

    (
        status,
        Json(HealthResponse {
            name: "eventsse".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: mode.to_string(),
        }),
    )
}
