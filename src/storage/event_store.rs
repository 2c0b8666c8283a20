//! Device event storage.

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};

use crate::storage::StorageError;
use crate::storage::db;
use crate::storage::types::{Event, EventSeverity, EventType, millis_to_utc};

/// Default and maximum page size for event listings.
const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;

/// Insert one event and return its ID.
pub(crate) async fn insert_event<'e, E>(executor: E, e: &Event) -> Result<i64, StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let data = e.data.as_ref().map(|d| d.to_string());
    let id = sqlx::query(
        "INSERT INTO events (device_id, ts, event_type, severity, subject, message, source, data)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(e.device_id)
    .bind(e.ts.timestamp_millis())
    .bind(e.event_type.as_ref())
    .bind(e.severity.as_ref())
    .bind(e.subject.as_deref())
    .bind(e.message.as_deref())
    .bind(&e.source)
    .bind(data)
    .execute(executor)
    .await?
    .last_insert_rowid();
    Ok(id)
}

type EventRow = (
    i64,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
);

/// Event storage facade.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a single event.
    pub async fn insert(&self, event: &Event) -> Result<i64, StorageError> {
        insert_event(&self.pool, event).await
    }

    /// Insert events in one transaction. Returns the number inserted.
    pub async fn insert_many(&self, events: &[Event]) -> Result<usize, StorageError> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut tx = db::begin_write(&self.pool).await?;
        for event in events {
            insert_event(&mut *tx, event).await?;
        }
        tx.commit().await?;
        Ok(events.len())
    }

    /// Most recent events of a device, newest first.
    pub async fn list_for_device(
        &self,
        device_id: i64,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Event>, StorageError> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let since = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);

        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, device_id, ts, event_type, severity, subject, message, source, data
             FROM events WHERE device_id = ? AND ts >= ?
             ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(since)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, device_id, ts, event_type, severity, subject, message, source, data)| {
                    let data = data.map(|d| serde_json::from_str(&d)).transpose()?;
                    Ok(Event {
                        id: Some(id),
                        device_id,
                        ts: millis_to_utc(ts),
                        event_type: EventType::parse_lenient(&event_type),
                        severity: EventSeverity::parse_lenient(&severity),
                        subject,
                        message,
                        source,
                        data,
                    })
                },
            )
            .collect()
    }
}
