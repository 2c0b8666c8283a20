//! User-facing write and maintenance facades over the writer actor.
//!
//! - `StorageWriter`: non-blocking point and event writes
//! - `StorageAdmin`: flush, retention cleanup and shutdown

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::storage::StorageError;
use crate::storage::actor::Command;
use crate::storage::types::{Event, MetricPoint};

// =============================================================================
// Writer
// =============================================================================

/// Non-blocking storage writer.
///
/// Uses `try_send`: data is dropped and counted if the channel is full.
/// Points are buffered by the actor and flushed at the batch thresholds.
#[derive(Clone)]
pub struct StorageWriter {
    tx: mpsc::Sender<Command>,
    dropped_points: Arc<AtomicU64>,
}

impl std::fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWriter").finish_non_exhaustive()
    }
}

impl StorageWriter {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self {
            tx,
            dropped_points: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total points dropped because the channel was full or closed.
    pub fn dropped_points(&self) -> u64 {
        self.dropped_points.load(Ordering::Relaxed)
    }

    /// Queue points for the next batch insert.
    pub fn insert_points(&self, points: Vec<MetricPoint>) -> Result<(), StorageError> {
        if points.is_empty() {
            return Ok(());
        }
        let count = points.len() as u64;
        self.tx.try_send(Command::InsertPoints(points)).map_err(|e| {
            tracing::warn!(count, "Writer unavailable, dropping metric points");
            self.dropped_points.fetch_add(count, Ordering::Relaxed);
            StorageError::from(e)
        })
    }

    /// Queue a single event. Events are written immediately by the actor.
    pub fn insert_event(&self, event: Event) -> Result<(), StorageError> {
        self.tx.try_send(Command::InsertEvent(event)).map_err(|e| {
            tracing::warn!("Writer unavailable, dropping event");
            StorageError::from(e)
        })
    }

    /// Request a flush without waiting for it.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.tx
            .try_send(Command::Flush(None))
            .map_err(StorageError::from)
    }
}

// =============================================================================
// Admin
// =============================================================================

/// Storage administration.
#[derive(Clone)]
pub struct StorageAdmin {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for StorageAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdmin").finish_non_exhaustive()
    }
}

impl StorageAdmin {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Flush buffered points and wait until they are committed.
    pub async fn flush_and_wait(&self) -> Result<(), StorageError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(Some(ack_tx)))
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        ack_rx
            .await
            .map_err(|_| StorageError::Internal("writer dropped flush ack".to_string()))
    }

    pub async fn cleanup_points(&self, retention_days: u32) -> Result<(), StorageError> {
        self.tx
            .send(Command::CleanupPoints { retention_days })
            .await
            .map_err(|_| StorageError::WriterClosed)
    }

    pub async fn cleanup_events(&self, retention_days: u32) -> Result<(), StorageError> {
        self.tx
            .send(Command::CleanupEvents { retention_days })
            .await
            .map_err(|_| StorageError::WriterClosed)
    }

    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| StorageError::WriterClosed)
    }
}
