//! Event persistence contract.
//!
//! Events are stored under hierarchical keys (`{composition}/{id}`) so that a
//! lookup on a key prefix returns every event of a composition.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::Event;

/// Default number of events returned by [`Store::get`].
pub const DEFAULT_GET_LIMIT: usize = 500;

/// Options for [`Store::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Maximum number of events returned.
    pub limit: usize,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_GET_LIMIT,
        }
    }
}

impl GetOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self { limit }
    }
}

/// Build the storage key of an event.
pub fn prepare_key(id: &str, composition: Option<&str>) -> String {
    match composition {
        Some(composition) if !composition.is_empty() => format!("{composition}/{id}"),
        _ => id.to_string(),
    }
}

/// Keyed event storage.
#[async_trait]
pub trait Store: Send + Sync {
    /// Storage key for an event id, grouped under its composition when known.
    fn prepare_key(&self, id: &str, composition: Option<&str>) -> String {
        prepare_key(id, composition)
    }

    /// Store `event` under `key`, replacing any previous value.
    async fn set(&self, key: &str, event: &Event) -> StoreResult<()>;

    /// Events stored under `key` or any key below it (`key/...`), ordered by
    /// key. An empty `key` matches everything. `None` when nothing matches.
    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<Option<Vec<Event>>>;

    /// Delete the event stored under `key`.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Release the store. Later calls fail with `StoreError::Closed`.
    async fn close(&self) -> StoreResult<()>;

    /// Lifetime of newly stored events in seconds; `0` keeps them forever.
    fn set_ttl(&self, seconds: u64);

    /// Current lifetime of newly stored events in seconds.
    fn ttl(&self) -> u64;
}
