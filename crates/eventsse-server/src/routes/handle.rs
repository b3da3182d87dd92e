//! Event ingest endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use eventsse_core::{Event, Job};
use tracing::{debug, info};

use super::notifications::is_valid_field;
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, Delivery};

/// Receive one event.
/// POST /handle
///
/// Cache mode answers with the storage key; broker mode with an empty body
/// once the job is queued. An empty body is accepted and ignored.
pub async fn handle_event(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        debug!("Empty request body, nothing to handle");
        return Ok(StatusCode::OK.into_response());
    }

    let event: Event = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Invalid event payload: {}", e)))?;

    let Some(id) = event.id() else {
        return Err(ApiError::bad_request("Event has neither uid nor name"));
    };
    let composition = event.composition_id();
    if !is_valid_field(id) || composition.is_some_and(|c| !is_valid_field(c)) {
        return Err(ApiError::bad_request(
            "Event id and composition id must not contain line breaks",
        ));
    }

    let key = state.store().prepare_key(id, composition);
    debug!(
        key = %key,
        reason = event.reason.as_deref().unwrap_or_default(),
        patched = event.was_patched_by_platform(),
        "Event received"
    );

    match state.delivery() {
        Delivery::Cache(cache) => {
            state.store().set(&key, &event).await?;
            cache.set(key.clone(), event, state.config().ttl());
            info!(key = %key, "Event stored");
            Ok(key.into_response())
        }
        Delivery::Broker { ingest, .. } => {
            let mut job = Job::new(key.clone())?.with_retries(state.config().job_retries);
            job.encode(&event)?;
            ingest.publish(job).await?;
            info!(key = %key, queue = %ingest.name(), "Event queued");
            Ok(StatusCode::OK.into_response())
        }
    }
}
