//! Live-update notifications for dashboard consumers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Default number of buffered updates per subscriber.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

/// Raw metric map of one device for one ingestion cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUpdate {
    pub device_id: i64,
    pub device_uid: String,
    pub ts: DateTime<Utc>,
    pub metrics: BTreeMap<String, Value>,
}

impl DeviceUpdate {
    pub fn topic(&self) -> String {
        format!("device.{}", self.device_id)
    }
}

/// Best-effort fan-out of [`DeviceUpdate`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<DeviceUpdate>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.tx.subscribe()
    }

    /// Publish an update. Returns the number of receivers reached.
    ///
    /// Having no subscribers is normal and not an error.
    pub fn publish(&self, update: DeviceUpdate) -> usize {
        let topic = update.topic();
        match self.tx.send(update) {
            Ok(n) => {
                tracing::trace!(topic = %topic, receivers = n, "Published device update");
                n
            }
            Err(_) => 0,
        }
    }
}
