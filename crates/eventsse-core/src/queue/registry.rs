//! Scheme-keyed table of broker builders.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::memory::{MemoryBroker, MEMORY_SCHEME};
use super::Broker;
use crate::error::{QueueError, QueueResult};

/// Builds a broker from a parsed URI.
pub type BrokerBuilder = Arc<dyn Fn(&Url) -> QueueResult<Arc<dyn Broker>> + Send + Sync>;

/// Maps URI schemes to broker builders.
///
/// Built once at startup and handed to whoever needs to create brokers.
/// Registration takes `&mut self`, so it cannot race with lookups.
#[derive(Clone, Default)]
pub struct BrokerRegistry {
    builders: HashMap<String, BrokerBuilder>,
}

impl BrokerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in backends (`memory://`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MEMORY_SCHEME, |url| {
            let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::from_uri(url)?);
            Ok(broker)
        });
        registry
    }

    /// Register `builder` for `scheme`, replacing any previous one.
    pub fn register<F>(&mut self, scheme: impl Into<String>, builder: F) -> &mut Self
    where
        F: Fn(&Url) -> QueueResult<Arc<dyn Broker>> + Send + Sync + 'static,
    {
        let scheme = scheme.into().to_ascii_lowercase();
        debug!(scheme = %scheme, "Registering broker builder");
        self.builders.insert(scheme, Arc::new(builder));
        self
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Create a broker for `uri` using the builder registered for its scheme.
    pub fn new_broker(&self, uri: &str) -> QueueResult<Arc<dyn Broker>> {
        let url = Url::parse(uri).map_err(|e| QueueError::invalid_uri(uri, e.to_string()))?;

        if url.scheme().is_empty() {
            return Err(QueueError::invalid_uri(uri, "missing scheme"));
        }

        let builder = self
            .builders
            .get(url.scheme())
            .ok_or_else(|| QueueError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
                uri: uri.to_string(),
            })?;

        builder(&url)
    }
}

impl fmt::Debug for BrokerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
