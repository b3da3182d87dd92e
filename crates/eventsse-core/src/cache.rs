//! Concurrent key-value cache with per-entry expiry.
//!
//! Expiry is checked on every read, so an entry past its deadline is never
//! returned even if it has not been purged yet. [`ExpiringCache::spawn_sweeper`]
//! adds an optional background purge that only reclaims memory.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound applied to TTLs so deadlines never overflow.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct Entry<V> {
    value: V,
    deadline: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.deadline
    }
}

/// Generic map whose entries become invisible once their TTL elapses.
///
/// All operations take `&self` and are safe to call from many tasks at once.
/// Reads share a lock; writes are exclusive. Values are cloned out, so no
/// caller ever observes a partially written entry.
pub struct ExpiringCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite `key`, visible for `ttl` from now.
    ///
    /// A zero `ttl` means the value is never visible: any existing entry for
    /// the key is dropped and nothing is stored.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.write();
        if ttl.is_zero() {
            entries.remove(&key);
            return;
        }

        let deadline = Instant::now() + ttl.min(MAX_TTL);
        entries.insert(key, Entry { value, deadline });
    }

    /// Get the value for `key` if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Expired: purge, unless a writer refreshed it in between.
        let mut entries = self.write();
        if entries.get(key).is_some_and(|e| !e.is_live(Instant::now())) {
            entries.remove(key);
        }
        None
    }

    /// Delete `key`. No-op if absent.
    pub fn remove(&self, key: &K) {
        self.write().remove(key);
    }

    /// Delete `key` only if `matches` accepts its current value.
    ///
    /// Lets a reader drop exactly what it read without losing a value a
    /// writer stored under the same key in between. Returns whether an entry
    /// was removed.
    pub fn remove_if<F>(&self, key: &K, matches: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let mut entries = self.write();
        if entries.get(key).is_some_and(|e| matches(&e.value)) {
            entries.remove(key);
            return true;
        }
        false
    }

    /// Remove `key` and return its value if it was still live.
    pub fn pop(&self, key: &K) -> Option<V> {
        let entry = self.write().remove(key)?;
        entry.is_live(Instant::now()).then_some(entry.value)
    }

    /// Snapshot of the keys that are not expired at the time of the call.
    ///
    /// The order is unspecified but fixed for the returned vector; writers
    /// running concurrently do not affect it.
    pub fn keys(&self) -> Vec<K> {
        let now = Instant::now();
        self.read()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Start a background task purging expired entries every `interval`.
    ///
    /// The task holds a weak reference and stops once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired cache entries");
                }
            }
        })
    }
}

impl<K, V> Default for ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
