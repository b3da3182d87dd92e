//! Background tasks owned by the server.
//!
//! In cache mode this is the expired-entry sweeper; in broker mode the worker
//! pool moving jobs from the ingest queue to the delivery queue.

use eventsse_core::WorkerPool;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handles of the running background tasks.
#[derive(Default)]
pub struct BackgroundTasks {
    /// Cache sweeper (cache mode, unless disabled).
    sweeper: Option<JoinHandle<()>>,
    /// Ingest workers (broker mode).
    pool: Option<WorkerPool>,
}

impl BackgroundTasks {
    pub fn new(sweeper: Option<JoinHandle<()>>, pool: Option<WorkerPool>) -> Self {
        if sweeper.is_some() {
            debug!("Cache sweeper running");
        }
        if let Some(ref pool) = pool {
            debug!(workers = pool.len(), "Ingest workers running");
        }
        Self { sweeper, pool }
    }

    /// Whether an ingest worker pool is running.
    pub fn has_workers(&self) -> bool {
        self.pool.is_some()
    }

    /// Stop the sweeper and wait for the workers to exit.
    pub async fn shutdown(self) {
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
            debug!("Cache sweeper stopped");
        }
        if let Some(pool) = self.pool {
            pool.shutdown().await;
        }
        info!("Background tasks stopped");
    }
}
