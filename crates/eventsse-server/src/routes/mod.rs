//! Route definitions for the HTTP API.

mod events;
mod handle;
mod health;
mod notifications;

use axum::{routing::get, routing::post, Router};

use crate::state::AppState;

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Ingest
        .route("/handle", post(handle::handle_event))
        // Delivery
        .route("/notifications", get(notifications::notifications))
        // Stored events
        .route("/events", get(events::list_events))
        .route("/events/:composition", get(events::list_composition_events))
        .route(
            "/events/:composition/:event",
            get(events::get_composition_event),
        )
        // Attach state
        .with_state(state)
}

pub use events::*;
pub use handle::*;
pub use health::*;
pub use notifications::*;
