//! Server state management.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventsse_core::error::EventsseResult;
use eventsse_core::{Broker, BrokerRegistry, ExpiringCache, Event, MemoryStore, Queue, Store};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::background::BackgroundTasks;
use crate::config::{ServerConfig, DELIVERY_QUEUE, INGEST_QUEUE};

/// Where received events wait until a notifications request drains them.
#[derive(Clone)]
pub enum Delivery {
    /// Events are buffered in an expiring cache keyed by storage key.
    Cache(Arc<ExpiringCache<String, Event>>),
    /// Events flow through a broker: ingest queue, workers, delivery queue.
    Broker {
        broker: Arc<dyn Broker>,
        ingest: Arc<dyn Queue>,
        delivery: Arc<dyn Queue>,
    },
}

impl Delivery {
    pub fn is_broker(&self) -> bool {
        matches!(self, Delivery::Broker { .. })
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub delivery: Delivery,
    healthy: AtomicBool,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create a cache-mode state.
    pub fn with_cache(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let cache = Arc::new(ExpiringCache::new());
        Self::build(config, store, Delivery::Cache(cache))
    }

    /// Create a broker-mode state using `broker` for both queues.
    pub fn with_broker(
        config: ServerConfig,
        store: Arc<dyn Store>,
        broker: Arc<dyn Broker>,
    ) -> EventsseResult<Self> {
        let ingest = broker.queue(INGEST_QUEUE)?;
        let delivery = broker.queue(DELIVERY_QUEUE)?;
        Ok(Self::build(
            config,
            store,
            Delivery::Broker {
                broker,
                ingest,
                delivery,
            },
        ))
    }

    /// Create the state described by `config`, resolving the broker URI
    /// through `registry`. Events are persisted in a [`MemoryStore`].
    pub fn from_config(config: ServerConfig, registry: &BrokerRegistry) -> EventsseResult<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = Arc::new(MemoryStore::with_ttl(config.ttl_secs));

        match config.broker_uri.clone() {
            Some(uri) => {
                let broker = registry.new_broker(&uri)?;
                info!(uri = %uri, "Broker mode enabled");
                Self::with_broker(config, store, broker)
            }
            None => {
                info!("Cache mode enabled");
                Ok(Self::with_cache(config, store))
            }
        }
    }

    fn build(config: ServerConfig, store: Arc<dyn Store>, delivery: Delivery) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                delivery,
                healthy: AtomicBool::new(true),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn delivery(&self) -> &Delivery {
        &self.inner.delivery
    }

    /// Token cancelled once shutdown starts.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Whether the service still accepts work.
    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// Start the sweeper (cache mode) or the ingest worker pool (broker mode).
    pub async fn start_background(&self) -> EventsseResult<BackgroundTasks> {
        let config = self.config();
        match self.delivery() {
            Delivery::Cache(cache) => {
                let sweeper = (config.sweep_interval_secs > 0).then(|| {
                    cache.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs))
                });
                Ok(BackgroundTasks::new(sweeper, None))
            }
            Delivery::Broker {
                ingest, delivery, ..
            } => {
                let pool = crate::pipeline::spawn_forwarders(
                    Arc::clone(ingest),
                    Arc::clone(delivery),
                    Arc::clone(self.store()),
                    config,
                    self.shutdown_token().child_token(),
                )
                .await?;
                Ok(BackgroundTasks::new(None, Some(pool)))
            }
        }
    }

    /// Begin shutdown: health reports unavailable and new notification
    /// streams end immediately.
    pub fn begin_shutdown(&self) {
        self.inner.healthy.store(false, Ordering::Release);
        self.inner.shutdown.cancel();
    }

    /// Stop background work and release the broker, cache and store.
    pub async fn shutdown(&self, background: BackgroundTasks) {
        self.begin_shutdown();
        background.shutdown().await;

        match self.delivery() {
            Delivery::Cache(cache) => cache.clear(),
            Delivery::Broker { broker, .. } => {
                if let Err(e) = broker.close().await {
                    warn!(error = %e, "Failed to close broker");
                }
            }
        }

        if let Err(e) = self.store().close().await {
            warn!(error = %e, "Failed to close store");
        }
        info!("Application state released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_selects_mode() {
        let registry = BrokerRegistry::with_defaults();

        let state = AppState::from_config(ServerConfig::default(), &registry).unwrap();
        assert!(!state.delivery().is_broker());

        let config = ServerConfig::default().with_broker_uri("memory://?capacity=4");
        let state = AppState::from_config(config, &registry).unwrap();
        assert!(state.delivery().is_broker());
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_fatal() {
        let registry = BrokerRegistry::with_defaults();
        let config = ServerConfig::default().with_broker_uri("bad://x");
        assert!(AppState::from_config(config, &registry).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_flips_health() {
        let state = AppState::with_cache(ServerConfig::default(), Arc::new(MemoryStore::new()));
        let background = state.start_background().await.unwrap();
        assert!(state.is_healthy());

        state.shutdown(background).await;
        assert!(!state.is_healthy());
        assert!(state.shutdown_token().is_cancelled());
    }
}
