//! External recovery for the collector scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::{Backend, CollectorRegistry};

/// Restarts the scheduler when `status()` reports it is not running.
///
/// The scheduler never restarts itself; this is the only recovery path.
pub struct Watchdog {
    registry: CollectorRegistry,
    backend: Arc<dyn Backend>,
    collector_id: String,
    interval: Duration,
}

impl Watchdog {
    pub fn new(
        registry: CollectorRegistry,
        backend: Arc<dyn Backend>,
        collector_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            collector_id: collector_id.into(),
            interval,
        }
    }

    /// Check once; returns true when a restart was attempted.
    pub async fn check(&self) -> bool {
        if self.registry.status().await.running {
            return false;
        }
        tracing::warn!(collector_id = %self.collector_id, "Collector scheduler not running, restarting");
        // Clear a dead run before starting again
        self.registry.stop().await;
        match self
            .registry
            .start(Arc::clone(&self.backend), self.collector_id.clone())
            .await
        {
            Ok(()) => tracing::info!("Collector scheduler restarted by watchdog"),
            Err(e) => tracing::error!(error = %e, "Watchdog restart failed"),
        }
        true
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The scheduler is started by the caller
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check().await;
                    }
                }
            }
            tracing::debug!("Watchdog exited");
        })
    }
}
