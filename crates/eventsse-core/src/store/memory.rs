//! In-process [`Store`] backed by an [`ExpiringCache`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{GetOptions, Store};
use crate::cache::ExpiringCache;
use crate::error::{StoreError, StoreResult};
use crate::types::Event;

/// Lifetime used when the store TTL is 0 ("keep forever").
const NO_EXPIRY: Duration = Duration::from_secs(u32::MAX as u64);

/// Event store kept in process memory.
///
/// Stored events expire after the configured TTL, the same way keys bound to
/// a lease expire in an external key-value store.
pub struct MemoryStore {
    events: ExpiringCache<String, Event>,
    ttl_secs: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create a store whose events never expire.
    pub fn new() -> Self {
        Self::with_ttl(0)
    }

    /// Create a store whose events expire after `seconds`.
    pub fn with_ttl(seconds: u64) -> Self {
        Self {
            events: ExpiringCache::new(),
            ttl_secs: AtomicU64::new(seconds),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn lifetime(&self) -> Duration {
        match self.ttl_secs.load(Ordering::Relaxed) {
            0 => NO_EXPIRY,
            secs => Duration::from_secs(secs),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(&self, key: &str, event: &Event) -> StoreResult<()> {
        self.ensure_open()?;
        self.events
            .set(key.to_string(), event.clone(), self.lifetime());
        Ok(())
    }

    async fn get(&self, key: &str, options: GetOptions) -> StoreResult<Option<Vec<Event>>> {
        self.ensure_open()?;

        let mut keys: Vec<String> = self
            .events
            .keys()
            .into_iter()
            .filter(|k| matches_prefix(k, key))
            .collect();
        keys.sort();

        let found: Vec<Event> = keys
            .iter()
            .filter_map(|k| self.events.get(k))
            .take(options.limit)
            .collect();

        debug!(key = %key, found = found.len(), "Store lookup");
        Ok((!found.is_empty()).then_some(found))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        self.events.remove(&key.to_string());
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.events.clear();
        Ok(())
    }

    fn set_ttl(&self, seconds: u64) {
        self.ttl_secs.store(seconds, Ordering::Relaxed);
    }

    fn ttl(&self) -> u64 {
        self.ttl_secs.load(Ordering::Relaxed)
    }
}
