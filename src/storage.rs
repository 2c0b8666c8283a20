//! Storage Layer
//!
//! SQLite storage with a single buffered writer and pool-backed stores:
//! - **Writer**: async task owning batched point inserts, fed by a tokio mpsc channel
//! - **Stores**: async facades over the sqlx pool for current-state tables
//!
//! # Components
//!
//! - [`StorageWriter`]: non-blocking point and event writes via the channel
//! - [`StorageAdmin`]: retention cleanup, flush and shutdown
//! - [`DeviceStore`]: devices, state and capabilities
//! - [`CatalogStore`]: metric catalog with auto-registration
//! - [`LatestStore`]: latest-value snapshots with previous values
//! - [`InventoryStore`]: interfaces, leases and sessions
//! - [`EventStore`]: append-only device events
//! - [`StorageBuilder`] / [`StorageHandles`]: initialization and lifecycle management

mod actor;
mod builder;
mod catalog_store;
pub mod db;
mod device_store;
mod error;
mod event_store;
mod facades;
mod inventory_store;
mod latest_store;
mod schema;
mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use catalog_store::CatalogStore;
pub use device_store::{Capabilities, DeviceRecord, DeviceStore, SyncResult};
pub use error::StorageError;
pub use event_store::EventStore;
pub use facades::{StorageAdmin, StorageWriter};
pub use inventory_store::{
    InterfaceRecord, InventoryStore, LeaseRecord, RawRecord, SessionRecord, interface_type,
    lease_status,
};
pub use latest_store::{LatestStore, LatestUpdate, LatestValue, UpsertOutcome};
pub use schema::init_schema;
pub use types::{
    DEGRADED_AFTER, DOWN_AFTER, DeviceState, Event, EventSeverity, EventType, MetricPoint,
};
