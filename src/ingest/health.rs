//! Periodic freshness check of device state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::storage::{
    DeviceState, DeviceStore, Event, EventSeverity, EventType, StorageError, StorageWriter,
};

const EVENT_SOURCE: &str = "health";

/// Recomputes device state from `last_seen` and records transitions.
#[derive(Clone)]
pub struct DeviceHealthMonitor {
    devices: DeviceStore,
    writer: StorageWriter,
    interval: Duration,
}

impl std::fmt::Debug for DeviceHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHealthMonitor")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

fn transition_event(device_id: i64, device_uid: &str, state: DeviceState) -> Option<Event> {
    let (event_type, severity, message) = match state {
        DeviceState::Degraded => (
            EventType::DeviceDegraded,
            EventSeverity::Warning,
            "Device not responding for >30s",
        ),
        DeviceState::Down => (
            EventType::DeviceDown,
            EventSeverity::Error,
            "Device not responding for >120s",
        ),
        DeviceState::Up | DeviceState::Unknown => return None,
    };
    Some(
        Event::new(device_id, event_type, severity, EVENT_SOURCE)
            .with_subject(device_uid)
            .with_message(message),
    )
}

impl DeviceHealthMonitor {
    pub fn new(devices: DeviceStore, writer: StorageWriter, interval: Duration) -> Self {
        Self {
            devices,
            writer,
            interval,
        }
    }

    /// One pass over all enabled devices. Returns the number of state changes.
    pub async fn check_once(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut changed = 0;
        for device in self.devices.list_enabled().await? {
            let state = DeviceState::from_last_seen(device.last_seen, now);
            if state == device.state {
                continue;
            }
            self.devices.set_state(device.id, state).await?;
            changed += 1;
            tracing::info!(
                device = %device.device_uid,
                from = %device.state,
                to = %state,
                "Device state changed"
            );
            if let Some(event) = transition_event(device.id, &device.device_uid, state)
                && let Err(e) = self.writer.insert_event(event)
            {
                tracing::warn!(device = %device.device_uid, error = %e, "Failed to record state event");
            }
        }
        Ok(changed)
    }

    /// Run until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.check_once(Utc::now()).await {
                            tracing::error!(error = %e, "Health check failed");
                        }
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }
}
