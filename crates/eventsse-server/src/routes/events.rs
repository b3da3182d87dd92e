//! Stored event lookup.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use eventsse_core::GetOptions;
use tracing::debug;

use crate::error::ApiResult;
use crate::state::AppState;

/// List every stored event.
/// GET /events
pub async fn list_events(State(state): State<AppState>) -> ApiResult<Response> {
    lookup(&state, "").await
}

/// List the stored events of one composition.
/// GET /events/:composition
pub async fn list_composition_events(
    State(state): State<AppState>,
    Path(composition): Path<String>,
) -> ApiResult<Response> {
    lookup(&state, &composition).await
}

/// Get one stored event of a composition.
/// GET /events/:composition/:event
pub async fn get_composition_event(
    State(state): State<AppState>,
    Path((composition, event)): Path<(String, String)>,
) -> ApiResult<Response> {
    lookup(&state, &format!("{composition}/{event}")).await
}

async fn lookup(state: &AppState, prefix: &str) -> ApiResult<Response> {
    let options = GetOptions::with_limit(state.config().get_limit);
    match state.store().get(prefix, options).await? {
        Some(events) => {
            debug!(prefix = %prefix, count = events.len(), "Events found");
            Ok(Json(events).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
