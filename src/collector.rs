//! Collector Layer
//!
//! Tiered polling of RouterOS devices. Each device gets a [`DeviceCollector`]
//! that runs one Tokio task per tier against a shared, lock-protected
//! connection, and delivers results through a [`Backend`].
//!
//! # Architecture
//!
//! - [`Tier`]: cadence classes (`T0`, realtime, short, medium, long, extended)
//! - [`DeviceCollector`]: per-device tier tasks and connection state machine
//! - [`CollectorRegistry`]: reconciles the device list, start/stop/reload lifecycle
//! - [`Watchdog`]: restarts the registry when it is not running
//! - [`Backend`]: [`LocalBackend`] (in-process) or [`RemoteBackend`] (HTTP)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use routerwatch::collector::{CollectorRegistry, RemoteBackend};
//! use routerwatch::config::CollectorConfig;
//! use std::time::Duration;
//!
//! # async fn run(config: CollectorConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let backend = RemoteBackend::new("http://backend:8080", "collector-01", None, Duration::from_secs(10))?;
//! let registry = CollectorRegistry::from_config(&config);
//! registry.start(Arc::new(backend), "collector-01").await?;
//! println!("{} devices", registry.status().await.device_count);
//! registry.stop().await;
//! # Ok(())
//! # }
//! ```

mod backend;
mod device;
mod discovery;
mod registry;
mod state;
mod t0;
pub mod tiers;
mod traits;
mod watchdog;

pub use backend::{Backend, BackendError, LocalBackend, RemoteBackend};
pub use device::{DeviceCollector, DeviceStatus};
pub use discovery::discover;
pub use registry::{CollectorRegistry, CollectorStatus, DEFAULT_SHUTDOWN_TIMEOUT, RegistrySettings};
pub use state::{ConnectionState, HealthTracker, Transition};
pub use t0::{TrafficTracker, select_t0};
pub use traits::{CollectorError, MIN_CALL_TIMEOUT, PollLimits, Tier, call_timeout};
pub use watchdog::Watchdog;
