//! One device's collector: a task per tier sharing one connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::collector::discovery::discover;
use crate::collector::state::{ConnectionState, HealthTracker, Transition};
use crate::collector::t0::{TrafficTracker, select_t0};
use crate::collector::tiers::{self, PollContext, TierOutput};
use crate::collector::{Backend, PollLimits, Tier};
use crate::config::DeviceConfig;
use crate::ingest::{DeviceMetrics, EventRecord};
use crate::protocol::{ProtocolError, RouterClient};
use crate::storage::RawRecord;

/// Snapshot of one collector for status reporting.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub device_uid: String,
    pub state: ConnectionState,
    pub tiers: Vec<Tier>,
    pub last_error: Option<String>,
}

/// State shared by the tier tasks of one device.
struct Shared {
    device: DeviceConfig,
    /// Serializes every use of the connection.
    client: Mutex<Box<dyn RouterClient>>,
    backend: Arc<dyn Backend>,
    command_timeout: Duration,
    health: Mutex<HealthTracker>,
    traffic: Mutex<TrafficTracker>,
    t0_selection: Mutex<Vec<String>>,
    log_watermark: Mutex<Option<u64>>,
    last_error: Mutex<Option<String>>,
}

/// What a cycle achieved before it finished or ran out of time.
#[derive(Default)]
struct Progress {
    connected: bool,
    capabilities: Option<Map<String, Value>>,
}

/// Running collector for one device.
///
/// Built from a configuration snapshot and never mutated: a changed
/// configuration means stopping this collector and starting a new one.
pub struct DeviceCollector {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Vec<(Tier, JoinHandle<()>)>,
}

impl std::fmt::Debug for DeviceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCollector")
            .field("device_uid", &self.shared.device.device_uid)
            .field("tiers", &self.tiers())
            .finish_non_exhaustive()
    }
}

impl DeviceCollector {
    /// Spawn one task per tier scheduled for `device`.
    pub fn spawn(
        device: DeviceConfig,
        client: Box<dyn RouterClient>,
        backend: Arc<dyn Backend>,
        command_timeout: Duration,
    ) -> Self {
        let schedule = Tier::schedule(&device);
        let shared = Arc::new(Shared::new(device, client, backend, command_timeout));
        let cancel = CancellationToken::new();

        let tasks = schedule
            .into_iter()
            .map(|(tier, period)| {
                let handle = tokio::spawn(run_tier(
                    Arc::clone(&shared),
                    tier,
                    period,
                    cancel.child_token(),
                ));
                (tier, handle)
            })
            .collect();

        tracing::info!(
            device = %shared.device.device_uid,
            host = %shared.device.host,
            tier = %shared.device.collection_tier,
            "Device collector started"
        );
        Self {
            shared,
            cancel,
            tasks,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.shared.device
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.tasks.iter().map(|(t, _)| *t).collect()
    }

    /// True when a tier task exited without being cancelled.
    pub fn is_broken(&self) -> bool {
        !self.cancel.is_cancelled() && self.tasks.iter().any(|(_, h)| h.is_finished())
    }

    pub async fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_uid: self.shared.device.device_uid.clone(),
            state: self.shared.health.lock().await.state(),
            tiers: self.tiers(),
            last_error: self.shared.last_error.lock().await.clone(),
        }
    }

    /// Swap in a fresh client, closing the old connection.
    ///
    /// The next tier poll reconnects with the new client.
    pub async fn replace_client(&self, client: Box<dyn RouterClient>) {
        let mut current = self.shared.client.lock().await;
        current.disconnect().await;
        *current = client;
        tracing::info!(device = %self.shared.device.device_uid, "Client replaced");
    }

    /// Cancel every tier task, wait up to `grace` for them to exit, then close
    /// the connection. Tasks still running after `grace` are aborted.
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let uid = self.shared.device.device_uid.clone();

        for (tier, mut handle) in self.tasks {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(device = %uid, tier = %tier, "Tier task did not exit in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        self.shared.client.lock().await.disconnect().await;
        tracing::info!(device = %uid, "Device collector stopped");
    }
}

async fn run_tier(shared: Arc<Shared>, tier: Tier, period: Duration, cancel: CancellationToken) {
    let limits = PollLimits::for_interval(shared.command_timeout, period);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(
        device = %shared.device.device_uid,
        tier = %tier,
        period = ?period,
        limits = ?limits,
        "Tier loop started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.poll_once(tier, limits) => {}
        }
    }
}

impl Shared {
    fn new(
        device: DeviceConfig,
        client: Box<dyn RouterClient>,
        backend: Arc<dyn Backend>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            device,
            client: Mutex::new(client),
            backend,
            command_timeout,
            health: Mutex::new(HealthTracker::new(Instant::now())),
            traffic: Mutex::new(TrafficTracker::default()),
            t0_selection: Mutex::new(Vec::new()),
            log_watermark: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    fn uid(&self) -> &str {
        &self.device.device_uid
    }

    /// One poll cycle of `tier`: connect if needed, query, then deliver.
    ///
    /// Waits at most `limits.call` for the connection; a busy connection
    /// skips the cycle instead of delaying this tier. Everything done under
    /// the lock is bounded by `limits.cycle`, and the lock is released before
    /// anything is pushed to the backend.
    async fn poll_once(&self, tier: Tier, limits: PollLimits) {
        let deadline = tokio::time::Instant::now() + limits.cycle;
        let Ok(mut client) = tokio::time::timeout(limits.call, self.client.lock()).await else {
            tracing::debug!(device = %self.uid(), tier = %tier, "Connection busy, skipping cycle");
            return;
        };

        let mut progress = Progress::default();
        let attempt = tokio::time::timeout_at(
            deadline,
            self.exchange(&mut **client, tier, limits.call, &mut progress),
        )
        .await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => {
                // Replies of the abandoned call may still be on the wire
                client.disconnect().await;
                Err(ProtocolError::Timeout(limits.cycle))
            }
        };
        let dropped = !client.is_connected();
        drop(client);

        if progress.connected {
            tracing::info!(device = %self.uid(), tier = %tier, "Connected");
            if let Some(t) = self.health.lock().await.success(Instant::now()) {
                self.emit_transition(t, None).await;
            }
        }
        if let Some(caps) = progress.capabilities
            && let Err(e) = self.backend.push_capabilities(self.uid(), caps).await
        {
            tracing::warn!(device = %self.uid(), error = %e, "Failed to push capabilities");
        }

        match result {
            Ok(None) => {}
            Ok(Some(output)) => {
                if let Some(t) = self.health.lock().await.success(Instant::now()) {
                    self.emit_transition(t, None).await;
                }
                self.clear_error().await;
                self.deliver(tier, output).await;
            }
            Err(e) => self.on_failure(tier, &e, dropped).await,
        }
    }

    /// The part of a cycle that holds the connection. Returns None when the
    /// tier skips because it may not connect.
    async fn exchange(
        &self,
        client: &mut dyn RouterClient,
        tier: Tier,
        timeout: Duration,
        progress: &mut Progress,
    ) -> Result<Option<TierOutput>, ProtocolError> {
        if !client.is_connected() {
            if !tier.may_connect() {
                return Ok(None);
            }
            self.health.lock().await.connecting();
            client.connect().await?;
            progress.connected = true;

            match discover(client, timeout).await {
                Ok(caps) => progress.capabilities = Some(caps),
                Err(e) if e.is_transport() => {
                    client.disconnect().await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(device = %self.uid(), error = %e, "Capability discovery failed")
                }
            }
        }

        let selection = self.t0_selection.lock().await.clone();
        let watermark = *self.log_watermark.lock().await;
        let ctx = PollContext {
            device: &self.device,
            timeout,
            now: Utc::now(),
            t0_selection: &selection,
            log_watermark: watermark,
        };
        match tiers::poll(tier, client, &ctx).await {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                if e.is_transport() {
                    client.disconnect().await;
                }
                Err(e)
            }
        }
    }

    async fn on_failure(&self, tier: Tier, error: &ProtocolError, dropped: bool) {
        tracing::warn!(device = %self.uid(), tier = %tier, error = %error, "Poll failed");
        let transition = self.health.lock().await.failure(Instant::now(), dropped);
        if let Some(t) = transition {
            self.emit_transition(t, Some(error.to_string())).await;
        }

        let message = error.to_string();
        let changed = {
            let mut last = self.last_error.lock().await;
            let changed = last.as_deref() != Some(message.as_str());
            *last = Some(message.clone());
            changed
        };
        if changed
            && let Err(e) = self.backend.report_error(self.uid(), Some(&message)).await
        {
            tracing::debug!(device = %self.uid(), error = %e, "Failed to report device error");
        }
    }

    async fn clear_error(&self) {
        if self.last_error.lock().await.take().is_some()
            && let Err(e) = self.backend.report_error(self.uid(), None).await
        {
            tracing::debug!(device = %self.uid(), error = %e, "Failed to clear device error");
        }
    }

    async fn emit_transition(&self, transition: Transition, reason: Option<String>) {
        let (event_type, severity, message) = match transition {
            Transition::Up => ("device_up", "info", format!("Connected to {}", self.device.host)),
            Transition::Down => (
                "device_down",
                "error",
                reason.unwrap_or_else(|| "Device unreachable".to_string()),
            ),
        };
        tracing::info!(device = %self.uid(), event = event_type, "Connection state changed");

        let event = EventRecord {
            device_uid: self.uid().to_string(),
            ts: Some(Utc::now()),
            event_type: event_type.to_string(),
            severity: severity.to_string(),
            subject: Some(self.device.name.clone()),
            message: Some(message),
            data: None,
        };
        if let Err(e) = self.backend.push_events(vec![event]).await {
            tracing::warn!(device = %self.uid(), error = %e, "Failed to push state event");
        }
    }

    /// Push a poll's output and update per-device trackers.
    async fn deliver(&self, tier: Tier, mut output: TierOutput) {
        let uid = self.uid();

        if !output.traffic.is_empty() {
            let now = Instant::now();
            let mut traffic = self.traffic.lock().await;
            for (name, total) in &output.traffic {
                traffic.record(name, *total, now);
            }
        }
        if output.log_watermark.is_some() {
            *self.log_watermark.lock().await = output.log_watermark;
        }

        if !output.metrics.is_empty() {
            let batch = vec![DeviceMetrics::new(uid, Utc::now(), &output.metrics)];
            match self.backend.push_metrics(batch).await {
                Ok(report) => tracing::debug!(
                    device = %uid,
                    tier = %tier,
                    processed = report.metrics_processed,
                    "Metrics delivered"
                ),
                Err(e) => tracing::warn!(device = %uid, tier = %tier, error = %e, "Failed to push metrics"),
            }
        }

        if let Some(mut interfaces) = output.interfaces.take() {
            self.refresh_t0(&mut interfaces).await;
            if let Err(e) = self.backend.push_interfaces(uid, interfaces).await {
                tracing::warn!(device = %uid, error = %e, "Failed to push interfaces");
            }
        }

        if let Some(leases) = output.leases.take()
            && let Err(e) = self.backend.push_leases(uid, leases).await
        {
            tracing::warn!(device = %uid, error = %e, "Failed to push leases");
        }

        for (session_type, sessions) in output.sessions.drain(..) {
            if let Err(e) = self.backend.push_sessions(uid, session_type, sessions).await {
                tracing::warn!(device = %uid, session_type, error = %e, "Failed to push sessions");
            }
        }

        if !output.events.is_empty() {
            let count = output.events.len();
            match self.backend.push_events(output.events).await {
                Ok(created) => tracing::debug!(device = %uid, count, created, "Log events delivered"),
                Err(e) => tracing::warn!(device = %uid, error = %e, "Failed to push events"),
            }
        }
    }

    /// Recompute the T0 selection from a fresh interface inventory and mark
    /// the selected rows.
    async fn refresh_t0(&self, interfaces: &mut [RawRecord]) {
        let names: Vec<String> = interfaces
            .iter()
            .filter_map(|r| r.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect();
        let candidates: Vec<String> = interfaces
            .iter()
            .filter(|r| flag(r, "running") && !flag(r, "disabled"))
            .filter_map(|r| r.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        let selection = {
            let mut traffic = self.traffic.lock().await;
            let present: HashSet<&str> = names.iter().map(String::as_str).collect();
            traffic.retain(&present);

            if self.device.t0_active() {
                let pinned: Vec<String> = self
                    .device
                    .uplink_interfaces
                    .iter()
                    .chain(&self.device.sla_interfaces)
                    .filter(|n| present.contains(n.as_str()))
                    .cloned()
                    .collect();
                select_t0(
                    &pinned,
                    &candidates,
                    &self.device.interface_tiers,
                    &traffic,
                    self.device.t0_max_interfaces,
                )
            } else {
                Vec::new()
            }
        };

        for row in interfaces.iter_mut() {
            let Some(name) = row.get("name").and_then(|v| v.as_str()).map(str::to_string) else {
                continue;
            };
            let selected = selection.contains(&name);
            let tier = self.device.interface_tier(&name);
            row.insert("t0_enabled".into(), selected.to_string().into());
            row.insert("collection_tier".into(), tier.to_string().into());
        }

        tracing::debug!(device = %self.uid(), selection = ?selection, "T0 selection refreshed");
        *self.t0_selection.lock().await = selection;
    }
}

fn flag(row: &RawRecord, key: &str) -> bool {
    match row.get(key) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s == "true" || s == "yes",
        _ => false,
    }
}
