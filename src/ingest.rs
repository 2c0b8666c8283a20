//! Backend-side ingestion.
//!
//! - [`IngestionSink`]: points, latest snapshots, counter rates, inventory syncs
//! - [`Authenticator`]: HMAC request verification
//! - [`Notifier`]: live-update fan-out
//! - [`DeviceHealthMonitor`]: freshness-driven device state
//! - [`wire`]: JSON request and response bodies

mod auth;
mod health;
mod notify;
mod sink;
pub mod wire;

pub use auth::{AuthError, Authenticator, sign, verify};
pub use health::DeviceHealthMonitor;
pub use notify::{DEFAULT_NOTIFY_CAPACITY, DeviceUpdate, Notifier};
pub use sink::{IngestError, IngestReport, IngestionSink, InventorySync, session_metric_key};
pub use wire::{DeviceError, DeviceMetrics, Envelope, EventRecord};
