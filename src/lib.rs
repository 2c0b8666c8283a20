//! routerwatch - Tiered RouterOS Telemetry
//!
//! This crate provides the collection engine and the ingestion backend for
//! monitoring fleets of RouterOS devices. It can be used as a library, or run
//! as a standalone binary with the `routerwatch` executable.
//!
//! # Architecture
//!
//! - **Protocol**: binary management API (8728/8729) and REST clients behind one trait
//! - **Metric**: canonical keys, catalog, counter-to-rate conversion
//! - **Collector**: per-device tier loops, T0 interface selection, scheduler registry
//! - **Ingest**: HMAC authentication, ingestion sink, live notifications, health monitor
//! - **Storage**: SQLite persistence with a batching writer actor
//! - **Server**: HTTP ingestion API
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use routerwatch::{CollectorRegistry, IngestionSink, LocalBackend, Notifier, StorageBuilder};
//! use routerwatch::config::CollectorConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handles = StorageBuilder::new("sqlite:routerwatch.db?mode=rwc").build().await?;
//!     let sink = IngestionSink::new(&handles, Notifier::default());
//!     let registry = CollectorRegistry::from_config(&CollectorConfig::default());
//!     registry.start(Arc::new(LocalBackend::new(sink)), "collector-01").await?;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod ingest;
pub mod metric;
pub mod protocol;
pub mod server;
pub mod storage;

pub use collector::{
    Backend, BackendError, CollectorError, CollectorRegistry, CollectorStatus, LocalBackend,
    RegistrySettings, RemoteBackend, Tier, Watchdog,
};
pub use config::{AppConfig, CollectionTier, DeviceConfig};
pub use ingest::{Authenticator, IngestError, IngestionSink, Notifier};
pub use metric::{MetricKind, MetricValue};
pub use protocol::{ProtocolError, RouterClient, Row};
pub use storage::{
    DeviceState, DeviceStore, Event, EventSeverity, EventType, StorageBuilder, StorageError,
    StorageHandles, StorageWriter,
};
