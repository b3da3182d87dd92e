//! eventsse-server - HTTP ingest and Server-Sent Events server for eventsse.
//!
//! Events are POSTed to `/handle` and pushed to browsers that poll
//! `/notifications`. Without a broker URI events wait in an expiring cache;
//! with one they flow through an ingest queue, a worker pool and a delivery
//! queue.
//!
//! # Example
//!
//! ```ignore
//! use eventsse_core::BrokerRegistry;
//! use eventsse_server::{create_server, AppState, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_env();
//!     let state = AppState::from_config(config, &BrokerRegistry::with_defaults())?;
//!     let background = state.start_background().await?;
//!     let app = create_server(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8181").await?;
//!     axum::serve(listener, app).await?;
//!     state.shutdown(background).await;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod state;

pub use background::BackgroundTasks;
pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use state::{AppState, Delivery};

use axum::{middleware as axum_middleware, Router};
use tower_http::trace::TraceLayer;

/// Create the server with all routes and middleware.
pub fn create_server(state: AppState) -> Router {
    routes::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::cors_layer())
        .layer(axum_middleware::from_fn(middleware::logging_middleware))
}
