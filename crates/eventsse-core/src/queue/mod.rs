//! Pluggable message broker abstraction.
//!
//! A [`Broker`] owns named [`Queue`]s. Producers [`Queue::publish`] jobs;
//! consumers obtain a [`JobIter`] from [`Queue::consume`] and settle every job
//! they receive with [`Job::ack`] or [`Job::reject`]. Backends are selected at
//! startup from a URI scheme through a [`BrokerRegistry`].

mod job;
mod memory;
mod registry;
mod worker;

pub use job::{Acknowledger, Job, Priority, JSON_CONTENT_TYPE};
pub use memory::{FullPolicy, MemoryBroker, MemoryBrokerOptions, MEMORY_SCHEME};
pub use registry::{BrokerBuilder, BrokerRegistry};
pub use worker::{Disposition, JobHandler, WorkerPool};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, QueueResult};

/// Owner of a set of named queues.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Get the queue called `name`, creating it on first use.
    ///
    /// Repeated calls with the same name return handles to the same queue.
    fn queue(&self, name: &str) -> QueueResult<Arc<dyn Queue>>;

    /// Shut the broker and all its queues down.
    ///
    /// Blocked consumers and producers return `QueueError::Closed`.
    async fn close(&self) -> QueueResult<()>;
}

/// A named sequence of pending jobs plus the set of jobs in flight.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Name of the queue.
    fn name(&self) -> &str;

    /// Append `job` to the tail of the queue.
    async fn publish(&self, job: Job) -> QueueResult<()>;

    /// Start consuming. The returned iterator yields at most `window` jobs;
    /// a window of 0 means no limit.
    async fn consume(&self, window: usize) -> QueueResult<Box<dyn JobIter>>;

    /// Stop accepting new jobs. Pending jobs can still be consumed.
    async fn close(&self) -> QueueResult<()>;

    /// Number of pending jobs.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of delivered jobs not yet acknowledged or rejected.
    fn in_flight(&self) -> usize;
}

/// Lazy sequence of jobs delivered from a queue.
#[async_trait]
pub trait JobIter: Send {
    /// Wait for the next job.
    ///
    /// Returns `Ok(None)` once the iterator's window is used up,
    /// `QueueError::EndOfQueue` when the queue was closed and is empty, and
    /// `QueueError::Closed` when the broker shut down.
    async fn next(&mut self) -> QueueResult<Option<Job>>;

    /// Take the next job if one is pending right now.
    fn try_next(&mut self) -> QueueResult<Option<Job>>;

    /// Like [`JobIter::next`], giving up with `QueueError::Cancelled` once
    /// `cancel` fires.
    async fn next_or_cancel(&mut self, cancel: &CancellationToken) -> QueueResult<Option<Job>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            next = self.next() => next,
        }
    }
}
