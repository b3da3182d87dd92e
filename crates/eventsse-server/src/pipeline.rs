//! Broker-mode ingest pipeline.
//!
//! Jobs published by `POST /handle` land on the ingest queue. Each worker
//! decodes the event, persists it in the store and republishes it to the
//! delivery queue drained by `GET /notifications`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsse_core::error::{QueueError, QueueResult};
use eventsse_core::{Disposition, Event, Job, JobHandler, Queue, Store, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ServerConfig;

/// First wait after the delivery queue reports full.
const FULL_BACKOFF_START: Duration = Duration::from_millis(10);

/// Longest wait between two publish attempts on a full delivery queue.
const FULL_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Persists ingested events and forwards them for delivery.
///
/// A full delivery queue does not cost the job a retry: the worker holds the
/// job and retries the publish with backoff until space frees up or `cancel`
/// fires. Meanwhile the ingest queue fills and `POST /handle` answers 503.
pub struct ForwardHandler {
    store: Arc<dyn Store>,
    delivery: Arc<dyn Queue>,
    retries: u32,
    cancel: CancellationToken,
}

impl ForwardHandler {
    pub fn new(
        store: Arc<dyn Store>,
        delivery: Arc<dyn Queue>,
        retries: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            delivery,
            retries,
            cancel,
        }
    }

    async fn publish_when_space(&self, job: Job) -> QueueResult<()> {
        let mut backoff = FULL_BACKOFF_START;
        loop {
            match self.delivery.publish(job.clone()).await {
                Err(QueueError::QueueFull { .. }) => {
                    debug!(job_id = %job.id, ?backoff, "Delivery queue full, waiting");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(QueueError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(FULL_BACKOFF_MAX);
                }
                other => return other,
            }
        }
    }

    fn forward_job(&self, job: &Job, event: &Event) -> QueueResult<Job> {
        let mut forwarded = Job::new(job.id.clone())?
            .with_priority(job.priority)
            .with_retries(self.retries);
        forwarded.encode(event)?;
        Ok(forwarded)
    }
}

#[async_trait]
impl JobHandler for ForwardHandler {
    async fn handle(&self, job: &Job) -> Disposition {
        let event: Event = match job.decode() {
            Ok(event) => event,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Dropping undecodable job");
                return Disposition::Discard;
            }
        };

        if let Err(e) = self.store.set(&job.id, &event).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist event");
            return Disposition::Requeue;
        }

        let forwarded = match self.forward_job(job, &event) {
            Ok(forwarded) => forwarded,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to build delivery job");
                return Disposition::Discard;
            }
        };

        match self.publish_when_space(forwarded).await {
            Ok(()) => {
                debug!(job_id = %job.id, "Event forwarded for delivery");
                Disposition::Ack
            }
            Err(QueueError::Cancelled) => {
                warn!(job_id = %job.id, "Shutdown while delivery queue full");
                Disposition::Requeue
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to forward event");
                Disposition::Discard
            }
        }
    }
}

/// Start the ingest workers described by `config`.
pub async fn spawn_forwarders(
    ingest: Arc<dyn Queue>,
    delivery: Arc<dyn Queue>,
    store: Arc<dyn Store>,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> QueueResult<WorkerPool> {
    let handler = Arc::new(ForwardHandler::new(
        store,
        delivery,
        config.job_retries,
        cancel.clone(),
    ));
    WorkerPool::spawn(ingest, config.workers, handler, cancel).await
}
