//! Process-wide scheduler managing one [`DeviceCollector`] per device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::device::{DeviceCollector, DeviceStatus};
use crate::collector::{Backend, CollectorError};
use crate::config::{CollectorConfig, DeviceConfig};
use crate::protocol::{ClientFactory, DefaultClientFactory};

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing knobs of the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub reconcile_interval: Duration,
    pub command_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(2),
            command_timeout: Duration::from_secs(10),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl From<&CollectorConfig> for RegistrySettings {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            reconcile_interval: config.effective_reconcile_interval(),
            command_timeout: config.command_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Result of [`CollectorRegistry::status`].
#[derive(Debug, Clone, Default)]
pub struct CollectorStatus {
    pub running: bool,
    pub device_count: usize,
    /// Devices excluded because their configuration is invalid.
    pub rejected: Vec<String>,
    pub devices: Vec<DeviceStatus>,
}

/// Live collectors plus devices excluded until their configuration changes.
#[derive(Default)]
struct Fleet {
    collectors: HashMap<String, DeviceCollector>,
    rejected: HashMap<String, DeviceConfig>,
}

struct Running {
    backend: Arc<dyn Backend>,
    collector_id: String,
    cancel: CancellationToken,
    reconciler: JoinHandle<()>,
}

struct Inner {
    factory: Arc<dyn ClientFactory>,
    settings: RegistrySettings,
    fleet: Mutex<Fleet>,
    run: Mutex<Option<Running>>,
}

/// Scheduler with an explicit `start`/`stop`/`reload` lifecycle.
///
/// Cheap to clone; clones share the same fleet.
#[derive(Clone)]
pub struct CollectorRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field(
                "device_count",
                &self
                    .inner
                    .fleet
                    .try_lock()
                    .map(|f| f.collectors.len())
                    .unwrap_or(0),
            )
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl CollectorRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                settings,
                fleet: Mutex::new(Fleet::default()),
                run: Mutex::new(None),
            }),
        }
    }

    /// Registry using the binary API / REST clients.
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(
            Arc::new(DefaultClientFactory::new(config.connect_timeout)),
            RegistrySettings::from(config),
        )
    }

    /// Start collecting for every enabled device the backend lists.
    ///
    /// The first reconciliation runs before this returns.
    pub async fn start(
        &self,
        backend: Arc<dyn Backend>,
        collector_id: impl Into<String>,
    ) -> Result<(), CollectorError> {
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            return Err(CollectorError::Scheduler(
                "collector scheduler already running".to_string(),
            ));
        }
        let collector_id = collector_id.into();

        self.inner.reconcile(&backend).await;

        let cancel = CancellationToken::new();
        let reconciler = tokio::spawn(reconcile_loop(
            Arc::clone(&self.inner),
            Arc::clone(&backend),
            cancel.child_token(),
        ));
        *run = Some(Running {
            backend,
            collector_id: collector_id.clone(),
            cancel,
            reconciler,
        });

        let devices = self.inner.fleet.lock().await.collectors.len();
        tracing::info!(
            collector_id = %collector_id,
            devices,
            "Collector scheduler started"
        );
        Ok(())
    }

    /// Stop reconciliation, cancel every tier task and close every connection.
    ///
    /// Stopping a stopped scheduler is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.inner.run.lock().await.take() else {
            return;
        };
        self.inner.shutdown(running).await;
    }

    /// Stop, wait for every task to exit, then start again with the same backend.
    pub async fn reload(&self) -> Result<(), CollectorError> {
        let Some(running) = self.inner.run.lock().await.take() else {
            return Err(CollectorError::Scheduler(
                "collector scheduler not running".to_string(),
            ));
        };
        let backend = Arc::clone(&running.backend);
        let collector_id = running.collector_id.clone();
        self.inner.shutdown(running).await;
        tracing::info!(collector_id = %collector_id, "Reloading collector scheduler");
        self.start(backend, collector_id).await
    }

    pub async fn status(&self) -> CollectorStatus {
        let running = self
            .inner
            .run
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.reconciler.is_finished());

        let fleet = self.inner.fleet.lock().await;
        let mut devices = Vec::with_capacity(fleet.collectors.len());
        for collector in fleet.collectors.values() {
            devices.push(collector.status().await);
        }
        devices.sort_by(|a, b| a.device_uid.cmp(&b.device_uid));
        let mut rejected: Vec<String> = fleet.rejected.keys().cloned().collect();
        rejected.sort();

        CollectorStatus {
            running,
            device_count: fleet.collectors.len(),
            rejected,
            devices,
        }
    }

    /// Run one reconciliation immediately instead of waiting for the tick.
    pub async fn reconcile_now(&self) -> Result<(), CollectorError> {
        let backend = self
            .inner
            .run
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::clone(&r.backend))
            .ok_or_else(|| CollectorError::Scheduler("collector scheduler not running".to_string()))?;
        self.inner.reconcile(&backend).await;
        Ok(())
    }

    /// Rebuild one device's connection, e.g. after a credential change.
    ///
    /// Returns false when no collector runs for `device_uid`. A device that
    /// was rejected is retried on the next reconciliation.
    pub async fn refresh_client(&self, device_uid: &str) -> Result<bool, CollectorError> {
        let mut fleet = self.inner.fleet.lock().await;
        if fleet.rejected.remove(device_uid).is_some() {
            tracing::info!(device = %device_uid, "Rejected device will be retried");
        }
        let Some(collector) = fleet.collectors.get(device_uid) else {
            return Ok(false);
        };
        let client = self.inner.factory.create(collector.device())?;
        collector.replace_client(client).await;
        Ok(true)
    }
}

async fn reconcile_loop(inner: Arc<Inner>, backend: Arc<dyn Backend>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.settings.reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // start() already reconciled once
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => inner.reconcile(&backend).await,
        }
    }
    tracing::debug!("Reconciliation loop exited");
}

impl Inner {
    /// Diff the backend's device list against the live collectors.
    async fn reconcile(&self, backend: &Arc<dyn Backend>) {
        let devices = match backend.fetch_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch devices, keeping current collectors");
                return;
            }
        };
        let desired: HashMap<String, DeviceConfig> = devices
            .into_iter()
            .filter(|d| d.collection_enabled)
            .map(|d| (d.device_uid.clone(), d))
            .collect();

        let mut fleet = self.fleet.lock().await;

        let retired: Vec<String> = fleet
            .collectors
            .keys()
            .filter(|uid| !desired.contains_key(*uid))
            .cloned()
            .collect();
        let mut stopping: Vec<DeviceCollector> = retired
            .iter()
            .filter_map(|uid| fleet.collectors.remove(uid))
            .collect();
        fleet.rejected.retain(|uid, _| desired.contains_key(uid));

        let mut starting = Vec::new();
        for (uid, device) in desired {
            if fleet.rejected.get(&uid) == Some(&device) {
                continue;
            }
            if let Err(reason) = device.validate() {
                tracing::warn!(device = %uid, error = %reason, "Invalid device configuration, excluding");
                if let Some(old) = fleet.collectors.remove(&uid) {
                    stopping.push(old);
                }
                if let Err(e) = backend.report_error(&uid, Some(&reason)).await {
                    tracing::debug!(device = %uid, error = %e, "Failed to report device error");
                }
                fleet.rejected.insert(uid, device);
                continue;
            }
            fleet.rejected.remove(&uid);

            let rebuild = fleet.collectors.get(&uid).map(|current| {
                if current.is_broken() {
                    tracing::warn!(device = %uid, "Tier task exited unexpectedly, rebuilding collector");
                    true
                } else if current.device().requires_rebuild(&device) {
                    tracing::info!(device = %uid, "Device configuration changed, rebuilding collector");
                    true
                } else {
                    false
                }
            });
            match rebuild {
                Some(false) => continue,
                Some(true) => {
                    if let Some(old) = fleet.collectors.remove(&uid) {
                        stopping.push(old);
                    }
                }
                None => {}
            }
            starting.push(device);
        }

        // Old collectors are fully stopped before replacements start
        self.stop_all(stopping).await;

        for device in starting {
            let uid = device.device_uid.clone();
            match self.factory.create(&device) {
                Ok(client) => {
                    let collector = DeviceCollector::spawn(
                        device,
                        client,
                        Arc::clone(backend),
                        self.settings.command_timeout,
                    );
                    fleet.collectors.insert(uid, collector);
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(device = %uid, error = %reason, "Failed to build client");
                    if let Err(e) = backend.report_error(&uid, Some(&reason)).await {
                        tracing::debug!(device = %uid, error = %e, "Failed to report device error");
                    }
                    fleet.rejected.insert(uid, device);
                }
            }
        }
    }

    async fn stop_all(&self, collectors: Vec<DeviceCollector>) {
        if collectors.is_empty() {
            return;
        }
        let grace = self.settings.shutdown_timeout;
        let mut set = JoinSet::new();
        for collector in collectors {
            set.spawn(collector.stop(grace));
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                tracing::warn!(error = %e, "Collector stop task failed");
            }
        }
    }

    async fn shutdown(&self, running: Running) {
        running.cancel.cancel();
        let mut reconciler = running.reconciler;
        if tokio::time::timeout(self.settings.shutdown_timeout, &mut reconciler)
            .await
            .is_err()
        {
            tracing::warn!("Reconciliation loop did not exit in time, aborting");
            reconciler.abort();
        }

        let collectors: Vec<DeviceCollector> = {
            let mut fleet = self.fleet.lock().await;
            fleet.rejected.clear();
            fleet.collectors.drain().map(|(_, c)| c).collect()
        };
        let count = collectors.len();
        self.stop_all(collectors).await;
        tracing::info!(
            collector_id = %running.collector_id,
            devices = count,
            "Collector scheduler stopped"
        );
    }
}
