//! Server configuration.

use std::str::FromStr;
use std::time::Duration;

use eventsse_core::error::{EventsseError, EventsseResult};
use tracing::warn;

/// Queue receiving jobs from the ingest endpoint in broker mode.
pub const INGEST_QUEUE: &str = "events";

/// Queue drained by the notifications endpoint in broker mode.
pub const DELIVERY_QUEUE: &str = "notifications";

/// Configuration for the eventsse server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind (default: 0.0.0.0).
    pub host: String,
    /// Port to listen on (default: 8181).
    pub port: u16,
    /// Lifetime of received events in seconds (default: 120).
    pub ttl_secs: u64,
    /// Maximum number of events returned by the events endpoint (default: 500).
    pub get_limit: usize,
    /// Broker URI. Unset means events are buffered in the expiring cache.
    pub broker_uri: Option<String>,
    /// Number of ingest workers in broker mode (default: 4).
    pub workers: usize,
    /// Maximum number of jobs one notifications request drains (default: 1000).
    pub drain_limit: usize,
    /// Requeue budget of each published job (default: 3).
    pub job_retries: u32,
    /// Verbose logging (default: true).
    pub debug: bool,
    /// JSON log output (default: false).
    pub log_json: bool,
    /// Seconds between expired-entry sweeps of the cache; 0 disables (default: 30).
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8181,
            ttl_secs: 120,
            get_limit: 500,
            broker_uri: None,
            workers: 4,
            drain_limit: 1000,
            job_retries: 3,
            debug: true,
            log_json: false,
            sweep_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Set the bind address.
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Set the event lifetime in seconds.
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Switch to broker mode using `uri`.
    pub fn with_broker_uri(mut self, uri: impl Into<String>) -> Self {
        self.broker_uri = Some(uri.into());
        self
    }

    /// Set the number of ingest workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-request drain bound.
    pub fn with_drain_limit(mut self, drain_limit: usize) -> Self {
        self.drain_limit = drain_limit;
        self
    }

    /// Set the events endpoint result limit.
    pub fn with_get_limit(mut self, get_limit: usize) -> Self {
        self.get_limit = get_limit;
        self
    }

    /// Disable the background cache sweep.
    pub fn without_sweeper(mut self) -> Self {
        self.sweep_interval_secs = 0;
        self
    }

    /// Event lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Socket address string to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check values that have no sensible fallback.
    pub fn validate(&self) -> EventsseResult<()> {
        if self.ttl_secs == 0 {
            return Err(EventsseError::configuration(
                "EVENTSSE_TTL must be greater than 0",
            ));
        }
        if self.broker_uri.is_some() && self.workers == 0 {
            return Err(EventsseError::configuration(
                "EVENTSSE_WORKERS must be at least 1 when a broker is configured",
            ));
        }
        if self.drain_limit == 0 {
            return Err(EventsseError::configuration(
                "EVENTSSE_DRAIN_LIMIT must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Create config from environment variables.
    ///
    /// Reads:
    /// - `EVENTSSE_HOST` (default: 0.0.0.0)
    /// - `EVENTSSE_PORT` (default: 8181)
    /// - `EVENTSSE_TTL` (default: 120)
    /// - `EVENTSSE_GET_LIMIT` (default: 500)
    /// - `EVENTSSE_BROKER_URI` (default: unset, cache mode)
    /// - `EVENTSSE_WORKERS` (default: 4)
    /// - `EVENTSSE_DRAIN_LIMIT` (default: 1000)
    /// - `EVENTSSE_JOB_RETRIES` (default: 3)
    /// - `EVENTSSE_DEBUG` (default: true)
    /// - `EVENTSSE_LOG_JSON` (default: false)
    /// - `EVENTSSE_SWEEP_INTERVAL_SECS` (default: 30)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ServerConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("EVENTSSE_HOST") {
            config.host = host;
        }
        parse_into(&lookup, "EVENTSSE_PORT", &mut config.port);
        parse_into(&lookup, "EVENTSSE_TTL", &mut config.ttl_secs);
        parse_into(&lookup, "EVENTSSE_GET_LIMIT", &mut config.get_limit);
        parse_into(&lookup, "EVENTSSE_WORKERS", &mut config.workers);
        parse_into(&lookup, "EVENTSSE_DRAIN_LIMIT", &mut config.drain_limit);
        parse_into(&lookup, "EVENTSSE_JOB_RETRIES", &mut config.job_retries);
        parse_into(
            &lookup,
            "EVENTSSE_SWEEP_INTERVAL_SECS",
            &mut config.sweep_interval_secs,
        );

        if let Some(uri) = lookup("EVENTSSE_BROKER_URI").filter(|u| !u.trim().is_empty()) {
            config.broker_uri = Some(uri.trim().to_string());
        }

        if let Some(value) = lookup("EVENTSSE_DEBUG") {
            config.debug = parse_bool(&value).unwrap_or(config.debug);
        }
        if let Some(value) = lookup("EVENTSSE_LOG_JSON") {
            config.log_json = parse_bool(&value).unwrap_or(config.log_json);
        }

        config
    }
}

fn parse_into<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, value = %raw, "Ignoring unparsable value"),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
