//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::storage::actor::{DEFAULT_BATCH_FLUSH_INTERVAL, DEFAULT_BATCH_SIZE, DbActor};
use crate::storage::db;
use crate::storage::schema::init_schema;
use crate::storage::{
    CatalogStore, DeviceStore, EventStore, InventoryStore, LatestStore, StorageAdmin,
    StorageError, StorageWriter,
};

/// Default channel capacity for writer commands.
///
/// With batch flushing every 500 items or 1 second, this capacity buffers
/// roughly 20 seconds of inserts at 500 batches/sec before dropping.
const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    url: String,
    channel_capacity: usize,
    batch_size: usize,
    batch_flush_interval: Duration,
}

impl StorageBuilder {
    /// Create a new storage builder for a sqlx SQLite URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_flush_interval: DEFAULT_BATCH_FLUSH_INTERVAL,
        }
    }

    /// Set the channel capacity for writer commands.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the batch size for point buffering. Default: 500 items.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the batch flush interval for point buffering. Default: 1 second.
    pub fn batch_flush_interval(mut self, interval: Duration) -> Self {
        self.batch_flush_interval = interval;
        self
    }

    /// Connect, create the schema, seed the catalog and spawn the writer.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        create_parent_dir(&self.url)?;

        let db = db::SqlitePool::connect(&self.url).await?;
        let pool = db.inner().clone();
        init_schema(&pool).await?;

        let catalog = CatalogStore::new(pool.clone());
        catalog.seed_defaults().await?;

        let (actor_handle, tx) = DbActor::spawn(
            pool.clone(),
            self.channel_capacity,
            self.batch_size,
            self.batch_flush_interval,
        );

        Ok(StorageHandles {
            writer: StorageWriter::new(tx.clone()),
            admin: StorageAdmin::new(tx),
            devices: DeviceStore::new(pool.clone()),
            catalog,
            latest: LatestStore::new(pool.clone()),
            inventory: InventoryStore::new(pool.clone()),
            events: EventStore::new(pool),
            db,
            actor_handle: Some(actor_handle),
        })
    }
}

/// Create the directory of a file-backed SQLite URL.
fn create_parent_dir(url: &str) -> Result<(), StorageError> {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") || path.starts_with("file:") {
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::Internal(format!(
                "Failed to create database directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Buffered writer for points and events.
    pub writer: StorageWriter,
    /// Cleanup, flush and shutdown.
    pub admin: StorageAdmin,
    pub devices: DeviceStore,
    pub catalog: CatalogStore,
    pub latest: LatestStore,
    pub inventory: InventoryStore,
    pub events: EventStore,
    db: db::SqlitePool,
    actor_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StorageHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandles").finish_non_exhaustive()
    }
}

impl StorageHandles {
    /// Gracefully shut down the storage layer.
    ///
    /// Sends the shutdown command, waits for the writer to flush, then
    /// closes the pool.
    pub async fn shutdown(mut self) -> Result<(), StorageError> {
        self.admin.shutdown().await?;
        if let Some(handle) = self.actor_handle.take() {
            handle
                .await
                .map_err(|e| StorageError::Internal(format!("writer task failed: {e}")))?;
        }
        self.db.close().await;
        Ok(())
    }
}
