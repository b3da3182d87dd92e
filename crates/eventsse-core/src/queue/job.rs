//! Jobs: payload plus delivery metadata.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Content type of JSON encoded payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Priority level of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Settles a delivered job on behalf of the queue it came from.
///
/// Each backend binds its own implementation to a job when delivering it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The job was processed; remove it for good.
    async fn ack(&self) -> QueueResult<()>;

    /// The job failed. With `requeue` it goes back to the queue while retries
    /// remain; otherwise it is dropped.
    async fn reject(&self, requeue: bool) -> QueueResult<()>;
}

/// A unit of work published to a queue.
#[derive(Clone)]
pub struct Job {
    /// Unique id of the job.
    pub id: String,
    /// Priority level.
    pub priority: Priority,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// How many more times the job may be requeued after a rejection.
    pub retries_remaining: u32,
    /// Kind of error that made the last processing attempt fail.
    pub error_type: String,
    /// Content type of `raw`.
    pub content_type: String,
    /// Encoded payload.
    pub raw: Vec<u8>,
    acknowledger: Option<Arc<dyn Acknowledger>>,
}

impl Job {
    /// Create a job with normal priority, JSON content type and no retries.
    pub fn new(id: impl Into<String>) -> QueueResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(QueueError::InvalidJob("id cannot be empty".to_string()));
        }

        Ok(Self {
            id,
            priority: Priority::Normal,
            created_at: Utc::now(),
            retries_remaining: 0,
            error_type: String::new(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            raw: Vec::new(),
            acknowledger: None,
        })
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set how many times the job may be requeued.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    /// Bind the acknowledger of the delivery this job belongs to.
    pub fn with_acknowledger(mut self, acknowledger: Arc<dyn Acknowledger>) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    /// Copy of this job without its delivery binding.
    pub fn unbound(&self) -> Self {
        Self {
            acknowledger: None,
            ..self.clone()
        }
    }

    /// Whether the job came from a queue and can be acked or rejected.
    pub fn is_acknowledgeable(&self) -> bool {
        self.acknowledger.is_some()
    }

    /// Encode `payload` into `raw` according to the content type.
    pub fn encode<T: Serialize + ?Sized>(&mut self, payload: &T) -> QueueResult<()> {
        match self.content_type.as_str() {
            JSON_CONTENT_TYPE => {
                self.raw = serde_json::to_vec(payload).map_err(|e| QueueError::Encoding {
                    message: e.to_string(),
                    source: Some(e),
                })?;
                Ok(())
            }
            other => Err(QueueError::Encoding {
                message: format!("unsupported content type '{other}'"),
                source: None,
            }),
        }
    }

    /// Decode `raw` according to the content type.
    pub fn decode<T: DeserializeOwned>(&self) -> QueueResult<T> {
        match self.content_type.as_str() {
            JSON_CONTENT_TYPE => {
                serde_json::from_slice(&self.raw).map_err(|e| QueueError::Decoding {
                    message: e.to_string(),
                    source: Some(e),
                })
            }
            other => Err(QueueError::Decoding {
                message: format!("unsupported content type '{other}'"),
                source: None,
            }),
        }
    }

    /// Mark the job as delivered.
    pub async fn ack(&self) -> QueueResult<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.ack().await,
            None => Err(QueueError::NotAcknowledgeable(self.id.clone())),
        }
    }

    /// Mark the job as failed, optionally putting it back in the queue.
    pub async fn reject(&self, requeue: bool) -> QueueResult<()> {
        match &self.acknowledger {
            Some(acknowledger) => acknowledger.reject(requeue).await,
            None => Err(QueueError::NotAcknowledgeable(self.id.clone())),
        }
    }

    /// Size of the encoded payload in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("created_at", &self.created_at)
            .field("retries_remaining", &self.retries_remaining)
            .field("error_type", &self.error_type)
            .field("content_type", &self.content_type)
            .field("size", &self.raw.len())
            .field("acknowledgeable", &self.is_acknowledgeable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("job-1").unwrap();
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.retries_remaining, 0);
        assert_eq!(job.content_type, JSON_CONTENT_TYPE);
        assert!(!job.is_acknowledgeable());

        assert!(matches!(Job::new(""), Err(QueueError::InvalidJob(_))));
    }

    #[test]
    fn test_encode_decode() {
        let mut job = Job::new("job-1").unwrap().with_priority(Priority::High);
        job.encode(&json!({"reason": "Scheduled"})).unwrap();
        assert!(job.size() > 0);

        let value: serde_json::Value = job.decode().unwrap();
        assert_eq!(value["reason"], "Scheduled");
    }

    #[test]
    fn test_decode_errors() {
        let mut job = Job::new("job-1").unwrap();
        job.raw = b"not json".to_vec();
        assert!(matches!(
            job.decode::<serde_json::Value>(),
            Err(QueueError::Decoding { .. })
        ));

        job.content_type = "application/msgpack".to_string();
        assert!(matches!(job.encode(&1), Err(QueueError::Encoding { .. })));
        assert!(matches!(
            job.decode::<serde_json::Value>(),
            Err(QueueError::Decoding { source: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_local_job_cannot_be_acknowledged() {
        let job = Job::new("local").unwrap();
        assert!(matches!(
            job.ack().await,
            Err(QueueError::NotAcknowledgeable(id)) if id == "local"
        ));
        assert!(matches!(
            job.reject(true).await,
            Err(QueueError::NotAcknowledgeable(_))
        ));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
    }
}
