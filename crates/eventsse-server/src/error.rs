//! Error handling for the HTTP server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use eventsse_core::error::{EventsseError, QueueError, StoreError};
use serde::Serialize;
use std::fmt;

/// API error type.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    // Common error constructors
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { ref queue, capacity } => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL", err.to_string())
                    .with_details(serde_json::json!({
                        "queue": queue,
                        "capacity": capacity,
                    }))
            }
            QueueError::Closed(_) | QueueError::EndOfQueue(_) | QueueError::Cancelled => {
                ApiError::unavailable(err.to_string())
            }
            QueueError::InvalidJob(msg) => ApiError::bad_request(msg),
            QueueError::Encoding { message, .. } => {
                ApiError::internal(format!("Encoding error: {}", message))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => ApiError::unavailable("Store is closed"),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<EventsseError> for ApiError {
    fn from(err: EventsseError) -> Self {
        match err {
            EventsseError::Queue(e) => e.into(),
            EventsseError::Store(e) => e.into(),
            EventsseError::Configuration(msg) => ApiError::internal(msg),
            other => ApiError::internal(other.to_string()),
        }
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_errors_map_to_status() {
        let full: ApiError = QueueError::QueueFull {
            queue: "events".to_string(),
            capacity: 8,
        }
        .into();
        assert_eq!(full.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(full.code, "QUEUE_FULL");
        assert!(full.details.is_some());

        let closed: ApiError = QueueError::Closed("events".to_string()).into();
        assert_eq!(closed.status, StatusCode::SERVICE_UNAVAILABLE);

        let bad: ApiError = QueueError::InvalidJob("empty id".to_string()).into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let ack: ApiError = QueueError::NotAcknowledgeable("e1".to_string()).into();
        assert_eq!(ack.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_store_errors_map_to_status() {
        let closed: ApiError = StoreError::Closed.into();
        assert_eq!(closed.status, StatusCode::SERVICE_UNAVAILABLE);

        let backend: ApiError = StoreError::Backend("lease lost".to_string()).into();
        assert_eq!(backend.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(backend.message.contains("lease lost"));
    }
}
