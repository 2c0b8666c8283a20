//! Ingestion sink: turns collector payloads into stored points, latest
//! snapshots, inventory rows and live notifications.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::ingest::notify::{DeviceUpdate, Notifier};
use crate::ingest::wire::{DeviceError, DeviceMetrics, EventRecord};
use crate::metric::{MetricValue, RateOutcome, counter_rate, rate_key, split_key};
use crate::storage::{
    Capabilities, CatalogStore, DeviceRecord, DeviceStore, Event, EventSeverity, EventStore,
    EventType, InventoryStore, LatestStore, LatestUpdate, LeaseRecord, MetricPoint, RawRecord,
    StorageError, StorageHandles, StorageWriter, UpsertOutcome,
};

/// Source tag of events written through the sink.
const EVENT_SOURCE: &str = "collector";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Unknown device")]
    UnknownDevice(String),

    #[error("Empty metrics payload")]
    EmptyPayload,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Aggregate result of one metrics batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub metrics_processed: usize,
    pub rates_suppressed: usize,
    pub errors: Vec<DeviceError>,
}

/// Result of a lease or session sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InventorySync {
    pub synced: usize,
    pub active: usize,
}

#[derive(Debug, Default)]
struct DeviceOutcome {
    processed: usize,
    suppressed: usize,
}

/// Metric key derived from a session sync.
pub fn session_metric_key(session_type: &str) -> &'static str {
    if session_type == "pppoe" || session_type == "ppp" {
        "ppp.active_sessions"
    } else {
        "hotspot.active_users"
    }
}

/// Backend-side ingestion.
///
/// Clones share the same stores and notifier.
#[derive(Clone)]
pub struct IngestionSink {
    writer: StorageWriter,
    devices: DeviceStore,
    catalog: CatalogStore,
    latest: LatestStore,
    inventory: InventoryStore,
    events: EventStore,
    notifier: Notifier,
}

impl std::fmt::Debug for IngestionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionSink").finish_non_exhaustive()
    }
}

impl IngestionSink {
    pub fn new(storage: &StorageHandles, notifier: Notifier) -> Self {
        Self {
            writer: storage.writer.clone(),
            devices: storage.devices.clone(),
            catalog: storage.catalog.clone(),
            latest: storage.latest.clone(),
            inventory: storage.inventory.clone(),
            events: storage.events.clone(),
            notifier,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    async fn device(&self, device_uid: &str) -> Result<DeviceRecord, IngestError> {
        self.devices
            .get_by_uid(device_uid)
            .await?
            .ok_or_else(|| IngestError::UnknownDevice(device_uid.to_string()))
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Ingest a multi-device batch.
    ///
    /// Failures are isolated per device and reported in
    /// [`IngestReport::errors`]; only an empty batch fails as a whole.
    pub async fn ingest_metrics(
        &self,
        batch: &[DeviceMetrics],
    ) -> Result<IngestReport, IngestError> {
        if batch.is_empty() {
            return Err(IngestError::EmptyPayload);
        }

        let received = Utc::now();
        let mut report = IngestReport::default();
        for device in batch {
            match self.ingest_device(device, received).await {
                Ok(outcome) => {
                    report.metrics_processed += outcome.processed;
                    report.rates_suppressed += outcome.suppressed;
                }
                Err(e) => {
                    tracing::warn!(device = %device.device_uid, error = %e, "Metrics rejected");
                    report.errors.push(DeviceError {
                        device_uid: device.device_uid.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn ingest_device(
        &self,
        payload: &DeviceMetrics,
        received: DateTime<Utc>,
    ) -> Result<DeviceOutcome, IngestError> {
        let device = self.device(&payload.device_uid).await?;
        if payload.metrics.is_empty() {
            return Err(IngestError::EmptyPayload);
        }
        let ts = payload.ts.unwrap_or(received);

        self.devices.touch_last_seen(device.id, received).await?;

        let mut points = Vec::with_capacity(payload.metrics.len());
        let mut updates = Vec::with_capacity(payload.metrics.len());
        let mut counters = Vec::new();
        for (wire_key, raw) in &payload.metrics {
            let Some(value) = MetricValue::from_json(raw) else {
                continue;
            };
            let (key, interface) = split_key(wire_key);
            let entry = self.catalog.resolve(&key).await?;
            let metric_id = entry
                .id
                .ok_or_else(|| StorageError::Internal(format!("catalog entry '{key}' has no id")))?;

            if entry.is_counter()
                && let Some(v) = value.as_f64()
            {
                counters.push((updates.len(), v));
            }
            points.push(MetricPoint {
                device_id: device.id,
                metric_id,
                metric_key: key.clone(),
                interface: interface.clone(),
                ts_collected: ts,
                ts_received: received,
                value: value.clone(),
            });
            updates.push(LatestUpdate {
                device_id: device.id,
                metric_key: key,
                interface,
                value,
                ts,
            });
        }
        if points.is_empty() {
            return Err(IngestError::InvalidPayload(
                "no usable metric values".to_string(),
            ));
        }

        let mut outcome = DeviceOutcome {
            processed: points.len(),
            suppressed: 0,
        };
        self.writer.insert_points(points)?;
        let upserted = self.latest.upsert_many(&updates).await?;

        let mut rate_points = Vec::new();
        let mut rate_updates = Vec::new();
        for (idx, value) in counters {
            let update = &updates[idx];
            let previous = match upserted.get(idx) {
                Some(UpsertOutcome::Stale) | None => continue,
                Some(o) => o.previous(),
            };
            match counter_rate(previous, value, ts) {
                RateOutcome::Rate(rate) => {
                    let key = rate_key(&update.metric_key);
                    let entry = self.catalog.resolve(&key).await?;
                    let metric_id = entry.id.ok_or_else(|| {
                        StorageError::Internal(format!("catalog entry '{key}' has no id"))
                    })?;
                    rate_points.push(MetricPoint {
                        device_id: device.id,
                        metric_id,
                        metric_key: key.clone(),
                        interface: update.interface.clone(),
                        ts_collected: ts,
                        ts_received: received,
                        value: MetricValue::Numeric(rate),
                    });
                    rate_updates.push(LatestUpdate {
                        device_id: device.id,
                        metric_key: key,
                        interface: update.interface.clone(),
                        value: MetricValue::Numeric(rate),
                        ts,
                    });
                }
                RateOutcome::CounterReset => {
                    outcome.suppressed += 1;
                    tracing::debug!(
                        device = %device.device_uid,
                        metric = %update.metric_key,
                        interface = ?update.interface,
                        "Counter went backwards, rate suppressed"
                    );
                }
                RateOutcome::NoBaseline | RateOutcome::NonIncreasingTime => {}
            }
        }
        if !rate_points.is_empty() {
            self.writer.insert_points(rate_points)?;
            self.latest.upsert_many(&rate_updates).await?;
        }

        self.notifier.publish(DeviceUpdate {
            device_id: device.id,
            device_uid: device.device_uid.clone(),
            ts,
            metrics: payload.metrics.clone(),
        });

        Ok(outcome)
    }

    /// Store one derived gauge for a device at `ts`.
    async fn record_gauge(
        &self,
        device_id: i64,
        key: &str,
        value: f64,
        ts: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let entry = self.catalog.resolve(key).await?;
        let metric_id = entry
            .id
            .ok_or_else(|| StorageError::Internal(format!("catalog entry '{key}' has no id")))?;
        self.writer.insert_points(vec![MetricPoint {
            device_id,
            metric_id,
            metric_key: key.to_string(),
            interface: None,
            ts_collected: ts,
            ts_received: ts,
            value: MetricValue::Numeric(value),
        }])?;
        self.latest
            .upsert(&LatestUpdate {
                device_id,
                metric_key: key.to_string(),
                interface: None,
                value: MetricValue::Numeric(value),
                ts,
            })
            .await?;
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Store events. Events of unknown devices are skipped.
    pub async fn ingest_events(&self, records: &[EventRecord]) -> Result<usize, IngestError> {
        let mut ids: HashMap<&str, Option<i64>> = HashMap::new();
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            let uid = record.device_uid.as_str();
            let id = match ids.get(uid) {
                Some(id) => *id,
                None => {
                    let id = self.devices.get_by_uid(uid).await?.map(|d| d.id);
                    ids.insert(uid, id);
                    id
                }
            };
            let Some(device_id) = id else {
                tracing::debug!(device = %uid, "Skipping event for unknown device");
                continue;
            };

            let mut event = Event::new(
                device_id,
                EventType::parse_lenient(&record.event_type),
                EventSeverity::parse_lenient(&record.severity),
                EVENT_SOURCE,
            );
            if let Some(ts) = record.ts {
                event = event.with_ts(ts);
            }
            if let Some(subject) = &record.subject {
                event = event.with_subject(subject.clone());
            }
            if let Some(message) = &record.message {
                event = event.with_message(message.clone());
            }
            if let Some(data) = &record.data {
                event = event.with_data(data.clone());
            }
            events.push(event);
        }
        Ok(self.events.insert_many(&events).await?)
    }

    // =========================================================================
    // Inventory
    // =========================================================================

    pub async fn sync_interfaces(
        &self,
        device_uid: &str,
        rows: &[RawRecord],
    ) -> Result<usize, IngestError> {
        let device = self.device(device_uid).await?;
        Ok(self
            .inventory
            .sync_interfaces(device.id, rows, &device.config)
            .await?)
    }

    /// Sync leases and derive `dhcp.active_leases` from the bound ones.
    pub async fn sync_leases(
        &self,
        device_uid: &str,
        rows: &[RawRecord],
    ) -> Result<InventorySync, IngestError> {
        let device = self.device(device_uid).await?;
        let synced = self.inventory.sync_leases(device.id, rows).await?;

        let now = Utc::now();
        let active = rows
            .iter()
            .filter_map(|r| LeaseRecord::from_raw(r, now))
            .filter(|l| l.status == "bound")
            .count();
        self.record_gauge(device.id, "dhcp.active_leases", active as f64, now)
            .await?;
        Ok(InventorySync { synced, active })
    }

    /// Sync sessions of one type and derive its active-count metric.
    pub async fn sync_sessions(
        &self,
        device_uid: &str,
        session_type: &str,
        rows: &[RawRecord],
    ) -> Result<InventorySync, IngestError> {
        if session_type.is_empty() {
            return Err(IngestError::InvalidPayload(
                "missing session_type".to_string(),
            ));
        }
        let device = self.device(device_uid).await?;
        let synced = self
            .inventory
            .sync_sessions(device.id, session_type, rows)
            .await?;
        self.record_gauge(
            device.id,
            session_metric_key(session_type),
            synced as f64,
            Utc::now(),
        )
        .await?;
        Ok(InventorySync {
            synced,
            active: synced,
        })
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub async fn update_capabilities(
        &self,
        device_uid: &str,
        capabilities: &serde_json::Map<String, Value>,
    ) -> Result<(), IngestError> {
        let device = self.device(device_uid).await?;
        let caps = Capabilities::from_wire(capabilities);
        self.devices.upsert_capabilities(device.id, &caps).await?;
        tracing::info!(
            device = %device_uid,
            version = %caps.routeros_version,
            supports_rest = caps.supports_rest,
            "Capabilities updated"
        );
        Ok(())
    }

    /// Configurations of all devices with collection enabled.
    pub async fn device_configs(&self) -> Result<Vec<DeviceConfig>, IngestError> {
        Ok(self
            .devices
            .list_enabled()
            .await?
            .into_iter()
            .map(|d| d.config)
            .collect())
    }

    pub async fn set_last_error(
        &self,
        device_uid: &str,
        error: Option<&str>,
    ) -> Result<(), IngestError> {
        Ok(self.devices.set_last_error(device_uid, error).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBuilder;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn setup() -> (StorageHandles, IngestionSink) {
        let storage = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
        storage
            .devices
            .upsert(&DeviceConfig::new("r1", "10.0.0.1").with_uplinks(&["ether1"]))
            .await
            .unwrap();
        storage
            .devices
            .upsert(&DeviceConfig::new("r2", "10.0.0.2"))
            .await
            .unwrap();
        let sink = IngestionSink::new(&storage, Notifier::default());
        (storage, sink)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn metrics(uid: &str, ts: DateTime<Utc>, pairs: &[(&str, Value)]) -> DeviceMetrics {
        DeviceMetrics {
            device_uid: uid.to_string(),
            ts: Some(ts),
            metrics: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn raw(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_batch_isolates_unknown_device() {
        let (storage, sink) = setup().await;
        let now = Utc::now();
        let batch = vec![
            metrics("r1", now, &[("system.cpu.load_pct", json!(12)), ("system.version", json!("7.15"))]),
            metrics("ghost", now, &[("system.cpu.load_pct", json!(50))]),
            metrics("r2", now, &[("system.cpu.load_pct", json!(3))]),
        ];

        let report = sink.ingest_metrics(&batch).await.unwrap();
        assert_eq!(report.metrics_processed, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].device_uid, "ghost");
        assert_eq!(report.errors[0].error, "Unknown device");

        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        assert!(r1.last_seen.is_some());
        assert_eq!(storage.latest.count(Some(r1.id)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_and_empty_device() {
        let (_storage, sink) = setup().await;
        assert!(matches!(
            sink.ingest_metrics(&[]).await,
            Err(IngestError::EmptyPayload)
        ));

        let report = sink
            .ingest_metrics(&[metrics("r1", Utc::now(), &[])])
            .await
            .unwrap();
        assert_eq!(report.metrics_processed, 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_reingest_upserts_latest() {
        let (storage, sink) = setup().await;
        for ts in [100, 105, 110] {
            sink.ingest_metrics(&[metrics("r1", at(ts), &[("system.cpu.load_pct", json!(ts))])])
                .await
                .unwrap();
        }
        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        let snapshot = storage.latest.device_snapshot(r1.id).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].value, MetricValue::Numeric(110.0));
        assert_eq!(snapshot[0].prev_value, Some(105.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_devices_on_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("ingest.db").display());
        let storage = StorageBuilder::new(&url).build().await.unwrap();
        for i in 0..20 {
            storage
                .devices
                .upsert(&DeviceConfig::new(format!("r{i}"), "10.0.0.1"))
                .await
                .unwrap();
        }
        let sink = IngestionSink::new(&storage, Notifier::default());

        let mut set = tokio::task::JoinSet::new();
        for i in 0..20 {
            for round in 0..10i64 {
                let sink = sink.clone();
                set.spawn(async move {
                    let key = "iface.ether1.rx_bytes_total";
                    let batch = [metrics(
                        &format!("r{i}"),
                        at(100 + round),
                        &[("system.cpu.load_pct", json!(round)), (key, json!(1000 * round))],
                    )];
                    sink.ingest_metrics(&batch).await
                });
            }
        }
        while let Some(res) = set.join_next().await {
            let report = res.unwrap().unwrap();
            assert!(report.errors.is_empty(), "ingest failed: {:?}", report.errors);
            assert_eq!(report.metrics_processed, 2);
        }

        for i in 0..20 {
            let device = storage.devices.get_by_uid(&format!("r{i}")).await.unwrap().unwrap();
            let snapshot = storage.latest.device_snapshot(device.id).await.unwrap();
            let cpu = snapshot
                .iter()
                .find(|v| v.metric_key == "system.cpu.load_pct")
                .unwrap();
            assert_eq!(cpu.value, MetricValue::Numeric(9.0));
        }
        storage.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_counter_rate_and_reset() {
        let (storage, sink) = setup().await;
        let key = "iface.ether1.rx_bytes_total";

        sink.ingest_metrics(&[metrics("r1", at(100), &[(key, json!(1000))])])
            .await
            .unwrap();
        sink.ingest_metrics(&[metrics("r1", at(105), &[(key, json!(1500))])])
            .await
            .unwrap();

        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        let snapshot = storage.latest.device_snapshot(r1.id).await.unwrap();
        let rate = snapshot
            .iter()
            .find(|v| v.metric_key == "iface.rx_bytes_per_sec")
            .unwrap();
        assert_eq!(rate.interface.as_deref(), Some("ether1"));
        assert_eq!(rate.value, MetricValue::Numeric(100.0));

        let report = sink
            .ingest_metrics(&[metrics("r1", at(110), &[(key, json!(900))])])
            .await
            .unwrap();
        assert_eq!(report.rates_suppressed, 1);
        let snapshot = storage.latest.device_snapshot(r1.id).await.unwrap();
        let rate = snapshot
            .iter()
            .find(|v| v.metric_key == "iface.rx_bytes_per_sec")
            .unwrap();
        // Unchanged: no rate emitted for the wrapped sample
        assert_eq!(rate.ts, at(105));
    }

    #[tokio::test]
    async fn test_publishes_one_update_per_device() {
        let (_storage, sink) = setup().await;
        let mut rx = sink.notifier().subscribe();
        sink.ingest_metrics(&[metrics(
            "r1",
            Utc::now(),
            &[("system.cpu.load_pct", json!(1)), ("system.uptime_sec", json!(5))],
        )])
        .await
        .unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.device_uid, "r1");
        assert_eq!(update.metrics.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_skip_unknown_devices() {
        let (storage, sink) = setup().await;
        let records = vec![
            EventRecord {
                device_uid: "r1".into(),
                event_type: "device_down".into(),
                severity: "error".into(),
                message: Some("gone".into()),
                ..Default::default()
            },
            EventRecord {
                device_uid: "ghost".into(),
                event_type: "device_down".into(),
                ..Default::default()
            },
            EventRecord {
                device_uid: "r1".into(),
                event_type: "something_new".into(),
                severity: "loud".into(),
                ..Default::default()
            },
        ];
        assert_eq!(sink.ingest_events(&records).await.unwrap(), 2);

        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        let stored = storage.events.list_for_device(r1.id, None, Some(10)).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|e| e.event_type == EventType::DeviceDown
            && e.severity == EventSeverity::Error));
        assert!(stored.iter().any(|e| e.event_type == EventType::Info
            && e.severity == EventSeverity::Info));
    }

    #[tokio::test]
    async fn test_sync_leases_derives_active_count() {
        let (storage, sink) = setup().await;
        let rows = vec![
            raw(json!({"address": "10.0.0.10", "mac-address": "AA:BB:CC:00:00:01", "status": "bound"})),
            raw(json!({"address": "10.0.0.11", "status": "waiting"})),
            raw(json!({"address": "10.0.0.12", "status": "bound", "dynamic": "false"})),
        ];
        let result = sink.sync_leases("r1", &rows).await.unwrap();
        assert_eq!(result, InventorySync { synced: 3, active: 2 });

        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        let snapshot = storage.latest.device_snapshot(r1.id).await.unwrap();
        let leases = snapshot
            .iter()
            .find(|v| v.metric_key == "dhcp.active_leases")
            .unwrap();
        assert_eq!(leases.value, MetricValue::Numeric(2.0));

        assert!(matches!(
            sink.sync_leases("ghost", &rows).await,
            Err(IngestError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_sessions_metric_per_type() {
        let (storage, sink) = setup().await;
        let rows = vec![
            raw(json!({"name": "alice", "address": "100.64.0.2", "uptime": "1h"})),
            raw(json!({"name": "bob", "address": "100.64.0.3", "uptime": "5m"})),
        ];
        let result = sink.sync_sessions("r1", "pppoe", &rows).await.unwrap();
        assert_eq!(result.synced, 2);

        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        let snapshot = storage.latest.device_snapshot(r1.id).await.unwrap();
        assert!(snapshot
            .iter()
            .any(|v| v.metric_key == "ppp.active_sessions" && v.value == MetricValue::Numeric(2.0)));
        assert_eq!(session_metric_key("hotspot"), "hotspot.active_users");
    }

    #[tokio::test]
    async fn test_sync_interfaces_uses_device_uplinks() {
        let (storage, sink) = setup().await;
        let rows = vec![
            raw(json!({"name": "ether1", "type": "ether", "running": "true"})),
            raw(json!({"name": "ether2", "type": "ether"})),
        ];
        assert_eq!(sink.sync_interfaces("r1", &rows).await.unwrap(), 2);

        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        let ifaces = storage.inventory.list_interfaces(r1.id).await.unwrap();
        assert!(ifaces.iter().find(|i| i.name == "ether1").unwrap().is_uplink);
        assert!(!ifaces.iter().find(|i| i.name == "ether2").unwrap().is_uplink);
    }

    #[tokio::test]
    async fn test_capabilities_and_device_configs() {
        let (storage, sink) = setup().await;
        let caps = json!({"version": "7.15.3", "board-name": "CCR2004", "supports_rest": true});
        sink.update_capabilities("r1", caps.as_object().unwrap())
            .await
            .unwrap();

        let r1 = storage.devices.get_by_uid("r1").await.unwrap().unwrap();
        let stored = storage.devices.get_capabilities(r1.id).await.unwrap().unwrap();
        assert!(stored.supports_rest);

        let configs = sink.device_configs().await.unwrap();
        assert_eq!(configs.len(), 2);
        let r1_config = configs.iter().find(|c| c.device_uid == "r1").unwrap();
        assert_eq!(r1_config.supports_rest, Some(true));
    }
}
