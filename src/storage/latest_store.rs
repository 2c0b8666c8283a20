//! Latest-value snapshots, one row per (device, metric key, interface).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::metric::format::format_value;
use crate::metric::{MetricUnit, MetricValue};
use crate::storage::StorageError;
use crate::storage::db;
use crate::storage::types::millis_to_utc;

/// One value to write into the latest table.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestUpdate {
    pub device_id: i64,
    pub metric_key: String,
    pub interface: Option<String>,
    pub value: MetricValue,
    pub ts: DateTime<Utc>,
}

/// What an upsert did to its row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpsertOutcome {
    /// First value for this key.
    Inserted,
    /// The row moved forward; `previous` is the replaced numeric value.
    Updated {
        previous: Option<(f64, DateTime<Utc>)>,
    },
    /// The sample is older than the stored one and was ignored.
    Stale,
}

impl UpsertOutcome {
    pub fn previous(&self) -> Option<(f64, DateTime<Utc>)> {
        match self {
            Self::Updated { previous } => *previous,
            _ => None,
        }
    }
}

/// A row of a device snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestValue {
    pub metric_key: String,
    /// None for device-level metrics.
    pub interface: Option<String>,
    pub value: MetricValue,
    pub ts: DateTime<Utc>,
    pub prev_value: Option<f64>,
    pub prev_ts: Option<DateTime<Utc>>,
    /// Human-readable value according to the catalog unit.
    pub display: String,
}

/// Latest-value facade.
#[derive(Clone)]
pub struct LatestStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for LatestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestStore").finish_non_exhaustive()
    }
}

type SnapshotRow = (
    String,
    String,
    Option<f64>,
    Option<String>,
    i64,
    Option<f64>,
    Option<i64>,
    Option<String>,
);

impl LatestStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert all updates in one transaction.
    ///
    /// The current value moves into `prev_value`/`prev_ts`. A sample older
    /// than the stored one leaves the row untouched, so `ts_collected` never
    /// goes backwards.
    pub async fn upsert_many(
        &self,
        updates: &[LatestUpdate],
    ) -> Result<Vec<UpsertOutcome>, StorageError> {
        let mut outcomes = Vec::with_capacity(updates.len());
        if updates.is_empty() {
            return Ok(outcomes);
        }

        let mut tx = db::begin_write(&self.pool).await?;
        for u in updates {
            let interface = u.interface.as_deref().unwrap_or("");
            let ts = u.ts.timestamp_millis();

            let current: Option<(Option<f64>, i64)> = sqlx::query_as(
                "SELECT value_float, ts_collected FROM metric_latest
                 WHERE device_id = ? AND metric_key = ? AND interface_name = ?",
            )
            .bind(u.device_id)
            .bind(&u.metric_key)
            .bind(interface)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((_, current_ts)) = current
                && ts < current_ts
            {
                outcomes.push(UpsertOutcome::Stale);
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO metric_latest (device_id, metric_key, interface_name, value_float, value_text, ts_collected)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (device_id, metric_key, interface_name) DO UPDATE SET
                    prev_value = metric_latest.value_float,
                    prev_ts = metric_latest.ts_collected,
                    value_float = excluded.value_float,
                    value_text = excluded.value_text,
                    ts_collected = excluded.ts_collected
                WHERE excluded.ts_collected >= metric_latest.ts_collected
                "#,
            )
            .bind(u.device_id)
            .bind(&u.metric_key)
            .bind(interface)
            .bind(u.value.as_f64())
            .bind(u.value.as_text())
            .bind(ts)
            .execute(&mut *tx)
            .await?;

            outcomes.push(match current {
                None => UpsertOutcome::Inserted,
                Some((value, prev_ts)) => UpsertOutcome::Updated {
                    previous: value.map(|v| (v, millis_to_utc(prev_ts))),
                },
            });
        }
        tx.commit().await?;

        Ok(outcomes)
    }

    /// Upsert a single value.
    pub async fn upsert(&self, update: &LatestUpdate) -> Result<UpsertOutcome, StorageError> {
        let mut outcomes = self.upsert_many(std::slice::from_ref(update)).await?;
        outcomes
            .pop()
            .ok_or_else(|| StorageError::Internal("empty upsert result".to_string()))
    }

    /// All latest values of a device, ordered by key then interface.
    pub async fn device_snapshot(&self, device_id: i64) -> Result<Vec<LatestValue>, StorageError> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT l.metric_key, l.interface_name, l.value_float, l.value_text, l.ts_collected,
                    l.prev_value, l.prev_ts, c.unit
             FROM metric_latest l LEFT JOIN metric_catalog c ON c.key = l.metric_key
             WHERE l.device_id = ?
             ORDER BY l.metric_key, l.interface_name",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(metric_key, interface, value_float, value_text, ts, prev_value, prev_ts, unit)| {
                    let value = match (value_float, value_text) {
                        (Some(v), _) => MetricValue::Numeric(v),
                        (None, Some(t)) => MetricValue::Text(t),
                        (None, None) => MetricValue::Text(String::new()),
                    };
                    let unit = unit
                        .and_then(|u| u.parse().ok())
                        .unwrap_or(MetricUnit::Count);
                    LatestValue {
                        display: format_value(&value, unit),
                        metric_key,
                        interface: (!interface.is_empty()).then_some(interface),
                        value,
                        ts: millis_to_utc(ts),
                        prev_value,
                        prev_ts: prev_ts.map(millis_to_utc),
                    }
                },
            )
            .collect())
    }

    /// Number of latest rows, optionally for one device.
    pub async fn count(&self, device_id: Option<i64>) -> Result<i64, StorageError> {
        let (n,): (i64,) = match device_id {
            Some(id) => {
                sqlx::query_as("SELECT COUNT(*) FROM metric_latest WHERE device_id = ?")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM metric_latest")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(n)
    }
}
