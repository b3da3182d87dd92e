//! Fixed-size pool of queue consumers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::Job;
use super::{JobIter, Queue};
use crate::error::QueueResult;

/// What to do with a job once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; acknowledge it.
    Ack,
    /// Failed; put it back while retries remain.
    Requeue,
    /// Failed for good; drop it.
    Discard,
}

/// Processes jobs taken from a queue by a [`WorkerPool`].
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Disposition;
}

/// Tokio tasks consuming one queue and settling each job according to the
/// handler's [`Disposition`].
pub struct WorkerPool {
    queue: String,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` consumers (at least one) on `queue`.
    ///
    /// Workers stop when `cancel` fires or the queue is closed.
    pub async fn spawn(
        queue: Arc<dyn Queue>,
        workers: usize,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> QueueResult<Self> {
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let iter = queue.consume(0).await?;
            handles.push(tokio::spawn(run_worker(
                worker,
                queue.name().to_string(),
                iter,
                Arc::clone(&handler),
                cancel.clone(),
            )));
        }

        info!(queue = %queue.name(), workers, "Worker pool started");
        Ok(Self {
            queue: queue.name().to_string(),
            cancel,
            handles,
        })
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every worker and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(queue = %self.queue, error = %e, "Worker task failed");
            }
        }
        info!(queue = %self.queue, "Worker pool stopped");
    }
}

async fn run_worker(
    worker: usize,
    queue: String,
    mut iter: Box<dyn JobIter>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    loop {
        let job = match iter.next_or_cancel(&cancel).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(e) => {
                if e.is_terminal() {
                    debug!(worker, queue = %queue, reason = %e, "Worker exiting");
                } else {
                    warn!(worker, queue = %queue, error = %e, "Worker stopped on error");
                }
                break;
            }
        };

        let disposition = handler.handle(&job).await;
        let settled = match disposition {
            Disposition::Ack => job.ack().await,
            Disposition::Requeue => job.reject(true).await,
            Disposition::Discard => job.reject(false).await,
        };

        if let Err(e) = settled {
            warn!(
                worker,
                queue = %queue,
                job_id = %job.id,
                ?disposition,
                error = %e,
                "Failed to settle job"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Broker, MemoryBroker};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails each job once, then acks it.
    struct FlakyHandler {
        seen: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, job: &Job) -> Disposition {
            self.seen
                .lock()
                .unwrap()
                .push((job.id.clone(), job.retries_remaining));
            if job.retries_remaining > 0 {
                Disposition::Requeue
            } else {
                Disposition::Ack
            }
        }
    }

    async fn wait_until_settled(queue: &Arc<dyn Queue>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !queue.is_empty() || queue.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue should drain");
    }

    #[tokio::test]
    async fn test_pool_applies_dispositions() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("ingest").unwrap();
        let handler = Arc::new(FlakyHandler {
            seen: Mutex::new(Vec::new()),
        });

        let pool = WorkerPool::spawn(
            Arc::clone(&queue),
            3,
            handler.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(pool.len(), 3);

        for i in 0..4 {
            queue
                .publish(Job::new(format!("j{i}")).unwrap().with_retries(1))
                .await
                .unwrap();
        }

        wait_until_settled(&queue).await;
        pool.shutdown().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        for i in 0..4 {
            let id = format!("j{i}");
            assert!(seen.contains(&(id.clone(), 1)));
            assert!(seen.contains(&(id, 0)));
        }
    }

    #[tokio::test]
    async fn test_pool_stops_when_broker_closes() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("ingest").unwrap();
        let handler = Arc::new(FlakyHandler {
            seen: Mutex::new(Vec::new()),
        });

        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(queue, 2, handler, cancel.clone())
            .await
            .unwrap();

        broker.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), pool.shutdown())
            .await
            .expect("workers should exit");
        assert!(cancel.is_cancelled());
    }
}
