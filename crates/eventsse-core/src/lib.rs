//! eventsse-core - Core library for eventsse.
//!
//! This crate provides the in-process event distribution engine behind the
//! eventsse server: a TTL-expiring cache, the event store contract, and a
//! pluggable broker/queue abstraction with acknowledgement semantics.
//!
//! # Example
//!
//! ```ignore
//! use eventsse_core::{BrokerRegistry, Job};
//!
//! let registry = BrokerRegistry::with_defaults();
//! let broker = registry.new_broker("memory://?capacity=128")?;
//! let queue = broker.queue("notifications")?;
//!
//! let mut job = Job::new("event-1")?.with_retries(3);
//! job.encode(&event)?;
//! queue.publish(job).await?;
//!
//! let mut jobs = queue.consume(10).await?;
//! while let Some(job) = jobs.try_next()? {
//!     // deliver, then
//!     job.ack().await?;
//! }
//! ```

pub mod cache;
pub mod error;
pub mod queue;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cache::ExpiringCache;
pub use error::{
    EventsseError, EventsseResult, QueueError, QueueResult, StoreError, StoreResult,
};
pub use queue::{
    Acknowledger, Broker, BrokerRegistry, Disposition, FullPolicy, Job, JobHandler, JobIter,
    MemoryBroker, MemoryBrokerOptions, Priority, Queue, WorkerPool,
};
pub use store::{GetOptions, MemoryStore, Store};
pub use types::{Event, COMPOSITION_ID_LABEL};
