//! In-process broker backend (`memory://`).
//!
//! URI parameters:
//! - `capacity`: maximum number of pending jobs per queue (default 1024)
//! - `policy`: what `publish` does on a full queue, `reject` (default) or `block`

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};
use url::Url;

use super::job::{Acknowledger, Job};
use super::{Broker, JobIter, Queue};
use crate::error::{QueueError, QueueResult};

/// URI scheme of the in-process broker.
pub const MEMORY_SCHEME: &str = "memory";

/// Default maximum number of pending jobs per queue.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Behaviour of `publish` on a full queue. Fixed per broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullPolicy {
    /// Fail with `QueueError::QueueFull`.
    #[default]
    Reject,
    /// Wait until a consumer takes a job.
    Block,
}

/// Construction parameters of a [`MemoryBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBrokerOptions {
    /// Maximum number of pending jobs per queue.
    pub capacity: usize,
    /// Behaviour of `publish` on a full queue.
    pub policy: FullPolicy,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            policy: FullPolicy::Reject,
        }
    }
}

impl MemoryBrokerOptions {
    /// Set the per-queue capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set the full-queue policy.
    pub fn with_policy(mut self, policy: FullPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Read options from the query string of a `memory://` URI.
    pub fn from_uri(url: &Url) -> QueueResult<Self> {
        let mut options = Self::default();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "capacity" => {
                    options.capacity = value
                        .parse::<usize>()
                        .ok()
                        .filter(|c| *c > 0)
                        .ok_or_else(|| {
                            QueueError::invalid_uri(
                                url.as_str(),
                                format!("capacity must be a positive integer, got '{value}'"),
                            )
                        })?;
                }
                "policy" => {
                    options.policy = match value.as_ref() {
                        "reject" => FullPolicy::Reject,
                        "block" => FullPolicy::Block,
                        other => {
                            return Err(QueueError::invalid_uri(
                                url.as_str(),
                                format!("policy must be 'reject' or 'block', got '{other}'"),
                            ))
                        }
                    };
                }
                other => debug!(param = %other, "Ignoring unknown memory broker parameter"),
            }
        }

        Ok(options)
    }
}

/// Broker keeping its queues in process memory.
pub struct MemoryBroker {
    options: MemoryBrokerOptions,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker with default options.
    pub fn new() -> Self {
        Self::with_options(MemoryBrokerOptions::default())
    }

    pub fn with_options(options: MemoryBrokerOptions) -> Self {
        Self {
            options,
            queues: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a broker from a `memory://` URI.
    pub fn from_uri(url: &Url) -> QueueResult<Self> {
        let options = MemoryBrokerOptions::from_uri(url)?;
        debug!(
            capacity = options.capacity,
            policy = ?options.policy,
            "Creating memory broker"
        );
        Ok(Self::with_options(options))
    }

    pub fn options(&self) -> MemoryBrokerOptions {
        self.options
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>> {
        let mut queues = self.queues();
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(name.to_string()));
        }

        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name, self.options)));
        let queue: Arc<dyn Queue> = queue.clone();
        Ok(queue)
    }

    async fn close(&self) -> QueueResult<()> {
        let queues = self.queues();
        self.closed.store(true, Ordering::Release);
        for queue in queues.values() {
            queue.shared.shutdown();
        }
        debug!(queues = queues.len(), "Memory broker closed");
        Ok(())
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    in_flight: HashMap<u64, Job>,
    next_tag: u64,
    /// No more publishes; pending jobs still drain.
    closed: bool,
    /// Broker shut down; everything fails with `Closed`.
    shut_down: bool,
}

struct Shared {
    name: String,
    options: MemoryBrokerOptions,
    state: Mutex<QueueState>,
    available: Notify,
    space: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> QueueError {
        QueueError::Closed(self.name.clone())
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        state.pending.clear();
        state.in_flight.clear();
        drop(state);
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    /// Pop the head of the queue and register it as in flight.
    fn take(self: &Arc<Self>) -> QueueResult<Option<Job>> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(self.closed_error());
        }

        let Some(job) = state.pending.pop_front() else {
            if state.closed {
                return Err(QueueError::EndOfQueue(self.name.clone()));
            }
            return Ok(None);
        };

        let tag = state.next_tag;
        state.next_tag += 1;
        state.in_flight.insert(tag, job.clone());
        drop(state);
        self.space.notify_waiters();

        let acknowledger = MemoryAcknowledger {
            shared: Arc::clone(self),
            tag,
            job_id: job.id.clone(),
        };
        Ok(Some(job.with_acknowledger(Arc::new(acknowledger))))
    }
}

/// A queue of a [`MemoryBroker`].
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    fn new(name: &str, options: MemoryBrokerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                options,
                state: Mutex::new(QueueState::default()),
                available: Notify::new(),
                space: Notify::new(),
            }),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn publish(&self, job: Job) -> QueueResult<()> {
        let shared = &self.shared;
        let job = job.unbound();

        loop {
            let space = shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = shared.lock();
                if state.shut_down || state.closed {
                    return Err(shared.closed_error());
                }

                if state.pending.len() < shared.options.capacity {
                    state.pending.push_back(job);
                    drop(state);
                    shared.available.notify_waiters();
                    return Ok(());
                }

                if shared.options.policy == FullPolicy::Reject {
                    return Err(QueueError::QueueFull {
                        queue: shared.name.clone(),
                        capacity: shared.options.capacity,
                    });
                }
            }

            space.await;
        }
    }

    async fn consume(&self, window: usize) -> QueueResult<Box<dyn JobIter>> {
        if self.shared.lock().shut_down {
            return Err(self.shared.closed_error());
        }

        Ok(Box::new(MemoryJobIter {
            shared: Arc::clone(&self.shared),
            remaining: if window == 0 { usize::MAX } else { window },
        }))
    }

    async fn close(&self) -> QueueResult<()> {
        self.shared.lock().closed = true;
        self.shared.available.notify_waiters();
        self.shared.space.notify_waiters();
        debug!(queue = %self.shared.name, "Queue closed");
        Ok(())
    }

    fn len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }
}

struct MemoryJobIter {
    shared: Arc<Shared>,
    remaining: usize,
}

impl MemoryJobIter {
    fn delivered(&mut self, job: Option<Job>) -> Option<Job> {
        if job.is_some() {
            self.remaining -= 1;
        }
        job
    }
}

#[async_trait]
impl JobIter for MemoryJobIter {
    async fn next(&mut self) -> QueueResult<Option<Job>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let shared = Arc::clone(&self.shared);
        loop {
            let available = shared.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(job) = shared.take()? {
                return Ok(self.delivered(Some(job)));
            }

            available.await;
        }
    }

    fn try_next(&mut self) -> QueueResult<Option<Job>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let job = self.shared.take()?;
        Ok(self.delivered(job))
    }
}

struct MemoryAcknowledger {
    shared: Arc<Shared>,
    tag: u64,
    job_id: String,
}

impl MemoryAcknowledger {
    fn settle(&self) -> QueueResult<(MutexGuard<'_, QueueState>, Job)> {
        let mut state = self.shared.lock();
        if state.shut_down {
            return Err(self.shared.closed_error());
        }
        match state.in_flight.remove(&self.tag) {
            Some(job) => Ok((state, job)),
            None => Err(QueueError::NotAcknowledgeable(self.job_id.clone())),
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> QueueResult<()> {
        self.settle()?;
        debug!(queue = %self.shared.name, job_id = %self.job_id, "Job acknowledged");
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> QueueResult<()> {
        let (mut state, mut job) = self.settle()?;

        if requeue && job.retries_remaining > 0 && !state.shut_down {
            job.retries_remaining -= 1;
            let retries = job.retries_remaining;
            state.pending.push_back(job);
            drop(state);
            self.shared.available.notify_waiters();
            debug!(
                queue = %self.shared.name,
                job_id = %self.job_id,
                retries_remaining = retries,
                "Job requeued"
            );
        } else if requeue {
            warn!(
                queue = %self.shared.name,
                job_id = %self.job_id,
                "Job discarded, no retries left"
            );
        } else {
            debug!(
                queue = %self.shared.name,
                job_id = %self.job_id,
                requeue,
                "Job discarded"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn broker(capacity: usize, policy: FullPolicy) -> MemoryBroker {
        MemoryBroker::with_options(
            MemoryBrokerOptions::default()
                .with_capacity(capacity)
                .with_policy(policy),
        )
    }

    fn job(id: &str) -> Job {
        Job::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        queue.publish(job("j1")).await.unwrap();

        let mut iter = queue.consume(1).await.unwrap();
        let delivered = iter.next().await.unwrap().unwrap();
        assert_eq!(delivered.id, "j1");
        assert_eq!(queue.in_flight(), 1);

        delivered.ack().await.unwrap();
        assert_eq!(queue.in_flight(), 0);

        let mut again = queue.consume(1).await.unwrap();
        assert!(again.try_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_ack_fails() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        queue.publish(job("j1")).await.unwrap();

        let delivered = queue.consume(1).await.unwrap().next().await.unwrap().unwrap();
        let copy = delivered.clone();
        delivered.ack().await.unwrap();
        assert!(matches!(
            copy.ack().await,
            Err(QueueError::NotAcknowledgeable(_))
        ));
    }

    #[tokio::test]
    async fn test_requeue_respects_retries() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        queue.publish(job("j1").with_retries(1)).await.unwrap();

        let mut iter = queue.consume(0).await.unwrap();
        let first = iter.try_next().unwrap().unwrap();
        first.reject(true).await.unwrap();

        let second = iter.try_next().unwrap().unwrap();
        assert_eq!(second.id, "j1");
        assert_eq!(second.retries_remaining, 0);
        second.reject(true).await.unwrap();

        assert!(iter.try_next().unwrap().is_none());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        queue.publish(job("j1").with_retries(5)).await.unwrap();

        let mut iter = queue.consume(0).await.unwrap();
        iter.try_next().unwrap().unwrap().reject(false).await.unwrap();
        assert!(iter.try_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_with_requeue_at_tail() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        for id in ["a", "b", "c"] {
            queue.publish(job(id).with_retries(1)).await.unwrap();
        }

        let mut iter = queue.consume(0).await.unwrap();
        let a = iter.try_next().unwrap().unwrap();
        a.reject(true).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = iter.try_next().unwrap() {
            order.push(job.id.clone());
            job.ack().await.unwrap();
        }
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_window_limits_deliveries() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        for id in ["a", "b", "c"] {
            queue.publish(job(id)).await.unwrap();
        }

        let mut iter = queue.consume(2).await.unwrap();
        assert!(iter.next().await.unwrap().is_some());
        assert!(iter.next().await.unwrap().is_some());
        assert!(iter.next().await.unwrap().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_policy_reports_full() {
        let broker = broker(2, FullPolicy::Reject);
        let queue = broker.queue("events").unwrap();
        queue.publish(job("a")).await.unwrap();
        queue.publish(job("b")).await.unwrap();

        let err = queue.publish(job("c")).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { capacity: 2, .. }));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let broker = broker(1, FullPolicy::Block);
        let queue = broker.queue("events").unwrap();
        queue.publish(job("a")).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.publish(job("b")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let mut iter = queue.consume(0).await.unwrap();
        let a = iter.next().await.unwrap().unwrap();
        assert_eq!(a.id, "a");

        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should be released")
            .unwrap()
            .unwrap();
        assert_eq!(iter.next().await.unwrap().unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_blocked_consumer_receives_published_job() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        let mut iter = queue.consume(0).await.unwrap();

        let consumer = tokio::spawn(async move { iter.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(job("late")).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivered.id, "late");
    }

    #[tokio::test]
    async fn test_broker_close_wakes_blocked_consumer() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        let mut iter = queue.consume(0).await.unwrap();

        let consumer = tokio::spawn(async move { iter.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(QueueError::Closed(_))));

        assert!(matches!(broker.queue("events"), Err(QueueError::Closed(_))));
        assert!(matches!(
            queue.publish(job("x")).await,
            Err(QueueError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_settle_after_broker_close_reports_closed() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        queue.publish(job("a")).await.unwrap();
        queue.publish(job("b")).await.unwrap();

        let mut iter = queue.consume(0).await.unwrap();
        let first = iter.try_next().unwrap().unwrap();
        let second = iter.try_next().unwrap().unwrap();

        broker.close().await.unwrap();
        assert!(matches!(first.ack().await, Err(QueueError::Closed(_))));
        assert!(matches!(
            second.reject(true).await,
            Err(QueueError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_close_drains_then_ends() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        queue.publish(job("a")).await.unwrap();
        queue.close().await.unwrap();

        assert!(matches!(
            queue.publish(job("b")).await,
            Err(QueueError::Closed(_))
        ));

        let mut iter = queue.consume(0).await.unwrap();
        assert_eq!(iter.next().await.unwrap().unwrap().id, "a");
        assert!(matches!(
            iter.next().await,
            Err(QueueError::EndOfQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_next_or_cancel() {
        let broker = MemoryBroker::new();
        let queue = broker.queue("events").unwrap();
        let mut iter = queue.consume(0).await.unwrap();

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), iter.next_or_cancel(&cancel))
            .await
            .unwrap();
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }

    #[test]
    fn test_options_from_uri() {
        let url = Url::parse("memory://?capacity=8&policy=block").unwrap();
        let options = MemoryBrokerOptions::from_uri(&url).unwrap();
        assert_eq!(options.capacity, 8);
        assert_eq!(options.policy, FullPolicy::Block);

        let url = Url::parse("memory://").unwrap();
        assert_eq!(
            MemoryBrokerOptions::from_uri(&url).unwrap(),
            MemoryBrokerOptions::default()
        );

        for bad in ["memory://?capacity=0", "memory://?capacity=x", "memory://?policy=drop"] {
            let url = Url::parse(bad).unwrap();
            assert!(matches!(
                MemoryBrokerOptions::from_uri(&url),
                Err(QueueError::InvalidUri { .. })
            ));
        }
    }
}
