//! Writer actor with MPSC channel.
//!
//! Single-writer pattern: one task owns buffered point inserts and processes
//! commands from a bounded channel. Points are flushed when the buffer reaches
//! `batch_size` items or `batch_flush_interval` has elapsed.

use std::time::Duration;

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::storage::StorageError;
use crate::storage::db;
use crate::storage::event_store::insert_event;
use crate::storage::types::{Event, MetricPoint};

// =============================================================================
// Constants
// =============================================================================

/// Default maximum items in buffer before flush.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default maximum time before buffer flush.
pub const DEFAULT_BATCH_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Rows per multi-row INSERT statement (7 binds each, well under SQLite's limit).
const INSERT_CHUNK_ROWS: usize = 100;

// =============================================================================
// Commands
// =============================================================================

/// Commands sent to the writer actor.
#[derive(Debug)]
pub enum Command {
    /// Append metric points (batch insert).
    InsertPoints(Vec<MetricPoint>),
    /// Insert event (immediate insert).
    InsertEvent(Event),
    /// Delete points older than retention_days.
    CleanupPoints { retention_days: u32 },
    /// Delete events older than retention_days.
    CleanupEvents { retention_days: u32 },
    /// Force flush; the optional sender is notified once the flush completed.
    Flush(Option<oneshot::Sender<()>>),
    /// Graceful shutdown.
    Shutdown,
}

// =============================================================================
// Buffers
// =============================================================================

/// Buffer for batch inserts with time-based and size-based flushing.
struct BatchBuffer<T> {
    items: Vec<T>,
    last_flush: Instant,
    size_threshold: usize,
    time_threshold: Duration,
}

impl<T> BatchBuffer<T> {
    fn new(size_threshold: usize, time_threshold: Duration) -> Self {
        Self {
            items: Vec::with_capacity(size_threshold),
            last_flush: Instant::now(),
            size_threshold,
            time_threshold,
        }
    }

    fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        // Reset flush timer on first item to avoid treating long-idle buffers as overdue
        if self.items.is_empty() {
            self.last_flush = Instant::now();
        }
        self.items.extend(items);
    }

    fn should_flush(&self) -> bool {
        self.items.len() >= self.size_threshold
            || (!self.items.is_empty() && self.last_flush.elapsed() >= self.time_threshold)
    }

    fn deadline(&self) -> Instant {
        self.last_flush + self.time_threshold
    }

    fn take(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.items)
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Database writer actor with batch buffering for metric points.
///
/// Only points are buffered. Events and cleanups run immediately since their
/// volume is low.
pub struct DbActor {
    pool: SqlitePool,
    rx: mpsc::Receiver<Command>,
    buffer: BatchBuffer<MetricPoint>,
}

impl DbActor {
    /// Spawn the writer actor task.
    ///
    /// Returns the task handle and the command sender.
    pub fn spawn(
        pool: SqlitePool,
        channel_capacity: usize,
        batch_size: usize,
        batch_flush_interval: Duration,
    ) -> (JoinHandle<()>, mpsc::Sender<Command>) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let actor = DbActor {
            pool,
            rx,
            buffer: BatchBuffer::new(batch_size.max(1), batch_flush_interval),
        };
        let handle = tokio::spawn(actor.run());
        (handle, tx)
    }

    async fn run(mut self) {
        tracing::info!("DbActor started");

        loop {
            let has_pending = !self.buffer.is_empty();
            let deadline = self.buffer.deadline();

            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break; // Shutdown requested
                        }
                    }
                    None => {
                        tracing::warn!("Channel disconnected, shutting down");
                        self.flush_all().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if has_pending => {
                    // Timeout: flush overdue
                }
            }

            if self.buffer.should_flush() {
                self.flush_all().await;
            }
        }

        tracing::info!("DbActor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::InsertPoints(points) => {
                self.buffer.extend(points);
            }
            Command::InsertEvent(event) => {
                if let Err(e) = insert_event(&self.pool, &event).await {
                    tracing::error!(error = %e, "Event insert failed");
                }
            }
            Command::CleanupPoints { retention_days } => {
                self.flush_all().await;
                if let Err(e) = self.cleanup("metric_points", "ts_collected", retention_days).await {
                    tracing::error!(error = %e, "Cleanup metric points failed");
                }
            }
            Command::CleanupEvents { retention_days } => {
                if let Err(e) = self.cleanup("events", "ts", retention_days).await {
                    tracing::error!(error = %e, "Cleanup events failed");
                }
            }
            Command::Flush(ack) => {
                self.flush_all().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Command::Shutdown => {
                tracing::info!("DbActor shutting down");
                self.flush_all().await;
                return true;
            }
        }
        false
    }

    async fn flush_all(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let points = self.buffer.take();
        if let Err(e) = insert_points_batch(&self.pool, &points).await {
            tracing::error!(error = %e, count = points.len(), "Points batch insert failed");
        }
    }

    async fn cleanup(
        &self,
        table: &'static str,
        ts_column: &'static str,
        retention_days: u32,
    ) -> Result<(), StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let sql = format!("DELETE FROM {table} WHERE {ts_column} < ?");
        let deleted = sqlx::query(&sql)
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!(table, deleted, retention_days, "Retention cleanup done");
        Ok(())
    }
}

/// Bulk insert points using multi-row INSERT statements inside one transaction.
pub(crate) async fn insert_points_batch(
    pool: &SqlitePool,
    points: &[MetricPoint],
) -> Result<(), StorageError> {
    if points.is_empty() {
        return Ok(());
    }

    let mut tx = db::begin_write(pool).await?;
    for chunk in points.chunks(INSERT_CHUNK_ROWS) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO metric_points (device_id, metric_id, interface_name, ts_collected, ts_received, value_float, value_text) ",
        );
        qb.push_values(chunk, |mut b, p| {
            b.push_bind(p.device_id)
                .push_bind(p.metric_id)
                .push_bind(p.interface.as_deref())
                .push_bind(p.ts_collected.timestamp_millis())
                .push_bind(p.ts_received.timestamp_millis())
                .push_bind(p.value.as_f64())
                .push_bind(p.value.as_text());
        });
        qb.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::debug!(count = points.len(), "Points batch inserted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricValue;
    use crate::storage::schema::init_schema;
    use crate::storage::types::{EventSeverity, EventType};

    async fn pool() -> SqlitePool {
        let db = db::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let pool = db.inner().clone();
        init_schema(&pool).await.unwrap();
        pool
    }

    fn point(device_id: i64, value: f64) -> MetricPoint {
        let now = Utc::now();
        MetricPoint {
            device_id,
            metric_id: 1,
            metric_key: "system.cpu.load_pct".to_string(),
            interface: None,
            ts_collected: now,
            ts_received: now,
            value: MetricValue::Numeric(value),
        }
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn test_actor_lifecycle() {
        let pool = pool().await;
        let (handle, tx) = DbActor::spawn(pool, 100, 10, Duration::from_secs(1));
        tx.send(Command::Shutdown).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_points_with_flush() {
        let pool = pool().await;
        let (handle, tx) = DbActor::spawn(pool.clone(), 100, 500, Duration::from_secs(60));

        tx.send(Command::InsertPoints(vec![point(1, 1.0), point(1, 2.0)]))
            .await
            .unwrap();
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Command::Flush(Some(ack_tx))).await.unwrap();
        ack_rx.await.unwrap();

        assert_eq!(count(&pool, "metric_points").await, 2);

        tx.send(Command::Shutdown).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_text_values_are_stored_as_text() {
        let pool = pool().await;
        let mut p = point(1, 0.0);
        p.value = MetricValue::from("7.15.3");
        insert_points_batch(&pool, &[p]).await.unwrap();

        let (f, t): (Option<f64>, Option<String>) =
            sqlx::query_as("SELECT value_float, value_text FROM metric_points")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(f, None);
        assert_eq!(t.as_deref(), Some("7.15.3"));
    }

    #[tokio::test]
    async fn test_batch_threshold() {
        let pool = pool().await;
        let (handle, tx) = DbActor::spawn(pool.clone(), 100, 250, Duration::from_secs(60));

        // 250 points spread over chunks exercise the multi-statement path
        let points: Vec<_> = (0..250).map(|i| point(1, f64::from(i))).collect();
        tx.send(Command::InsertPoints(points)).await.unwrap();

        // Size-triggered flush happens without an explicit Flush
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count(&pool, "metric_points").await, 250);

        tx.send(Command::Shutdown).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_time_based_flush() {
        let pool = pool().await;
        let (handle, tx) = DbActor::spawn(pool.clone(), 100, 500, Duration::from_millis(100));

        tx.send(Command::InsertPoints(vec![point(1, 42.0)]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(
            count(&pool, "metric_points").await,
            1,
            "Time-based flush should have written the point"
        );

        tx.send(Command::Shutdown).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer() {
        let pool = pool().await;
        let (handle, tx) = DbActor::spawn(pool.clone(), 100, 500, Duration::from_secs(60));
        tx.send(Command::InsertPoints(vec![point(1, 1.0)]))
            .await
            .unwrap();
        tx.send(Command::Shutdown).await.unwrap();
        handle.await.unwrap();
        assert_eq!(count(&pool, "metric_points").await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_operations() {
        let pool = pool().await;
        let (handle, tx) = DbActor::spawn(pool.clone(), 100, 500, Duration::from_secs(60));

        let mut old = point(1, 1.0);
        old.ts_collected = Utc::now() - chrono::Duration::days(100);
        tx.send(Command::InsertPoints(vec![old, point(1, 2.0)]))
            .await
            .unwrap();

        let old_event = Event::new(1, EventType::Info, EventSeverity::Info, "test")
            .with_ts(Utc::now() - chrono::Duration::days(200));
        tx.send(Command::InsertEvent(old_event)).await.unwrap();
        tx.send(Command::InsertEvent(Event::new(
            1,
            EventType::Info,
            EventSeverity::Info,
            "test",
        )))
        .await
        .unwrap();

        tx.send(Command::CleanupPoints { retention_days: 90 })
            .await
            .unwrap();
        tx.send(Command::CleanupEvents { retention_days: 180 })
            .await
            .unwrap();
        tx.send(Command::Shutdown).await.unwrap();
        handle.await.unwrap();

        assert_eq!(count(&pool, "metric_points").await, 1);
        assert_eq!(count(&pool, "events").await, 1);
    }
}
