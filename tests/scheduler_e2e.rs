//! End-to-end collection: scheduler, tier loops and the local backend.
//!
//! A scripted router stands in for the device; everything from the registry
//! down to SQLite is the real thing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use routerwatch::collector::{
    Backend, CollectorRegistry, ConnectionState, LocalBackend, RegistrySettings,
};
use routerwatch::config::DeviceConfig;
use routerwatch::ingest::{IngestionSink, Notifier};
use routerwatch::metric::MetricValue;
use routerwatch::protocol::{ClientFactory, ProtocolError, RouterClient, Row};
use routerwatch::storage::{EventType, StorageBuilder, StorageHandles};

fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn script() -> HashMap<String, Vec<Row>> {
    let mut s = HashMap::new();
    s.insert(
        "/system/resource/print".to_string(),
        vec![row(&[
            ("version", "7.15.3 (stable)"),
            ("cpu-load", "12"),
            ("total-memory", "1000"),
            ("free-memory", "250"),
            ("board-name", "RB5009"),
        ])],
    );
    s.insert(
        "/system/identity/print".to_string(),
        vec![row(&[("name", "edge-01")])],
    );
    s.insert(
        "/interface/print".to_string(),
        vec![
            row(&[
                ("name", "ether1"),
                ("type", "ether"),
                ("running", "true"),
                ("disabled", "false"),
                ("rx-byte", "1000"),
                ("tx-byte", "2000"),
            ]),
            row(&[
                ("name", "ether2"),
                ("type", "ether"),
                ("running", "false"),
                ("disabled", "false"),
            ]),
        ],
    );
    s
}

struct ScriptedClient {
    responses: Arc<HashMap<String, Vec<Row>>>,
    connects: Arc<AtomicUsize>,
    connected: bool,
}

#[async_trait]
impl RouterClient for ScriptedClient {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn run_command(
        &mut self,
        path: &str,
        _params: &[(&str, &str)],
        _timeout: Duration,
    ) -> Result<Vec<Row>, ProtocolError> {
        if !self.connected {
            return Err(ProtocolError::NotConnected);
        }
        Ok(self.responses.get(path).cloned().unwrap_or_default())
    }

    fn supports_rest(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Default)]
struct ScriptedFactory {
    connects: Arc<AtomicUsize>,
}

impl ClientFactory for ScriptedFactory {
    fn create(&self, _device: &DeviceConfig) -> Result<Box<dyn RouterClient>, ProtocolError> {
        Ok(Box::new(ScriptedClient {
            responses: Arc::new(script()),
            connects: Arc::clone(&self.connects),
            connected: false,
        }))
    }
}

async fn setup() -> (StorageHandles, Arc<dyn Backend>) {
    let handles = StorageBuilder::new("sqlite::memory:")
        .build()
        .await
        .expect("Failed to build storage");
    handles
        .devices
        .upsert(&DeviceConfig::new("edge-01", "10.0.0.1").with_uplinks(&["ether1"]))
        .await
        .expect("Failed to add device");
    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(IngestionSink::new(
        &handles,
        Notifier::default(),
    )));
    (handles, backend)
}

/// Poll `check` until it holds or a few seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn settings() -> RegistrySettings {
    RegistrySettings {
        reconcile_interval: Duration::from_secs(3600),
        command_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_collection_reaches_storage() {
    let (handles, backend) = setup().await;
    let factory = Arc::new(ScriptedFactory::default());
    let registry = CollectorRegistry::new(factory.clone(), settings());

    registry
        .start(Arc::clone(&backend), "collector-01")
        .await
        .expect("scheduler should start");

    let status = registry.status().await;
    assert!(status.running);
    assert_eq!(status.device_count, 1);

    let id = handles.devices.get_by_uid("edge-01").await.unwrap().unwrap().id;

    // Realtime metrics
    let latest = handles.latest.clone();
    assert!(
        eventually(|| {
            let latest = latest.clone();
            async move {
                latest
                    .device_snapshot(id)
                    .await
                    .map(|s| s.iter().any(|v| v.metric_key == "system.cpu.load_pct"))
                    .unwrap_or(false)
            }
        })
        .await,
        "realtime metrics never arrived"
    );
    let snapshot = handles.latest.device_snapshot(id).await.unwrap();
    let cpu = snapshot
        .iter()
        .find(|v| v.metric_key == "system.cpu.load_pct")
        .unwrap();
    assert_eq!(cpu.value, MetricValue::Numeric(12.0));

    // Interface inventory from the medium tier
    let inventory = handles.inventory.clone();
    assert!(
        eventually(|| {
            let inventory = inventory.clone();
            async move {
                inventory
                    .list_interfaces(id)
                    .await
                    .map(|i| i.len() == 2)
                    .unwrap_or(false)
            }
        })
        .await,
        "interfaces never synced"
    );
    let interfaces = handles.inventory.list_interfaces(id).await.unwrap();
    let ether1 = interfaces.iter().find(|i| i.name == "ether1").unwrap();
    assert!(ether1.is_uplink);

    // Connection event and discovered capabilities
    let events = handles.events.list_for_device(id, None, None).await.unwrap();
    assert!(
        events.iter().any(|e| e.event_type == EventType::DeviceUp),
        "expected a device_up event, got {events:?}"
    );
    let caps = handles.devices.get_capabilities(id).await.unwrap().unwrap();
    assert_eq!(caps.routeros_major, 7);
    assert_eq!(caps.identity, "edge-01");

    let status = registry.status().await;
    assert_eq!(status.devices[0].state, ConnectionState::Connected);
    // All tiers share one connection
    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);

    registry.stop().await;
    assert!(!registry.status().await.running);
    handles.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_device_is_not_collected() {
    let (handles, backend) = setup().await;
    handles
        .devices
        .upsert(&DeviceConfig::new("edge-01", "10.0.0.1").disabled())
        .await
        .unwrap();

    let factory = Arc::new(ScriptedFactory::default());
    let registry = CollectorRegistry::new(factory.clone(), settings());
    registry.start(backend, "collector-01").await.unwrap();

    let status = registry.status().await;
    assert!(status.running);
    assert_eq!(status.device_count, 0);
    assert_eq!(factory.connects.load(Ordering::SeqCst), 0);

    registry.stop().await;
    handles.shutdown().await.unwrap();
}
