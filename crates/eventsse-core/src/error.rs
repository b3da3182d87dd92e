//! Error types for eventsse operations.
//!
//! Queue and store failures have their own enums so that callers can match on
//! the exact condition (backpressure, shutdown, acknowledgement misuse).
//! [`EventsseError`] wraps them for code that only needs to propagate.

use thiserror::Error;

/// Result type alias for queue and broker operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for general eventsse operations.
pub type EventsseResult<T> = Result<T, EventsseError>;

/// Errors raised by brokers, queues and jobs.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The broker URI could not be parsed or carries no scheme.
    #[error("Malformed broker uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// No broker builder is registered for the URI scheme.
    #[error("Unsupported broker scheme '{scheme}' in uri '{uri}'")]
    UnsupportedScheme { scheme: String, uri: String },

    /// The queue reached its configured capacity.
    #[error("Queue '{queue}' is full (capacity {capacity})")]
    QueueFull { queue: String, capacity: usize },

    /// The broker or queue has been shut down.
    #[error("Queue '{0}' is closed")]
    Closed(String),

    /// The queue was closed and every pending job has been consumed.
    #[error("End of queue '{0}'")]
    EndOfQueue(String),

    /// The caller's cancellation signal fired while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// Ack or Reject on a job that is not bound to a queue delivery.
    #[error("Can't acknowledge job '{0}': it does not come from a queue or was already settled")]
    NotAcknowledgeable(String),

    /// The job itself is invalid.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// The payload could not be encoded into the job.
    #[error("Encoding error: {message}")]
    Encoding {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// The job payload could not be decoded.
    #[error("Decoding error: {message}")]
    Decoding {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

impl QueueError {
    /// Create an invalid uri error.
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a configuration problem (bad uri or scheme).
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidUri { .. } | Self::UnsupportedScheme { .. })
    }

    /// Whether the error means the queue will not produce anything else.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed(_) | Self::EndOfQueue(_) | Self::Cancelled
        )
    }
}

/// Errors raised by [`crate::store::Store`] implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store client has been closed.
    #[error("Store is closed")]
    Closed,

    /// Stored data could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing key-value system failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Umbrella error for eventsse operations.
#[derive(Error, Debug)]
pub enum EventsseError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Queue or broker error.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventsseError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
