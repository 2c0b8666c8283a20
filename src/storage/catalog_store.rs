//! Metric catalog storage with an in-memory cache.
//!
//! Catalog entries are effectively immutable once created, so resolved
//! entries are cached for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::config::CollectionTier;
use crate::metric::{CatalogEntry, MetricCategory, MetricKind, MetricUnit, default_catalog};
use crate::storage::StorageError;
use crate::storage::db;

type CatalogRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<f64>,
    Option<f64>,
    bool,
);

fn entry_from_row(row: CatalogRow) -> CatalogEntry {
    let (id, key, name, unit, kind, tier, category, expected_min, expected_max, active) = row;
    CatalogEntry {
        id: Some(id),
        key,
        name,
        unit: unit.parse().unwrap_or(MetricUnit::Count),
        kind: kind.parse().unwrap_or(MetricKind::Gauge),
        tier: tier.parse().unwrap_or(CollectionTier::T1),
        category: category.parse().unwrap_or(MetricCategory::Other),
        expected_min,
        expected_max,
        active,
    }
}

/// Metric catalog facade.
#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, CatalogEntry>>>,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore").finish_non_exhaustive()
    }
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert the built-in catalog. Existing keys are left untouched.
    ///
    /// Returns the number of entries inserted.
    pub async fn seed_defaults(&self) -> Result<usize, StorageError> {
        let mut inserted = 0;
        let mut tx = db::begin_write(&self.pool).await?;
        for entry in default_catalog() {
            inserted += sqlx::query(
                "INSERT INTO metric_catalog (key, name, unit, metric_type, collection_tier, category, expected_min, expected_max, active)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(&entry.key)
            .bind(&entry.name)
            .bind(entry.unit.as_ref())
            .bind(entry.kind.as_ref())
            .bind(entry.tier.as_ref())
            .bind(entry.category.as_ref())
            .bind(entry.expected_min)
            .bind(entry.expected_max)
            .bind(entry.active)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        tracing::debug!(inserted, "Metric catalog seeded");
        Ok(inserted)
    }

    /// Look up a catalog entry by key.
    pub async fn get(&self, key: &str) -> Result<Option<CatalogEntry>, StorageError> {
        if let Some(entry) = self.cache.read().await.get(key) {
            return Ok(Some(entry.clone()));
        }

        let row: Option<CatalogRow> = sqlx::query_as(
            "SELECT id, key, name, unit, metric_type, collection_tier, category, expected_min, expected_max, active
             FROM metric_catalog WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(entry) = row.map(entry_from_row) else {
            return Ok(None);
        };
        self.cache
            .write()
            .await
            .insert(entry.key.clone(), entry.clone());
        Ok(Some(entry))
    }

    /// Get or create the entry for `key`.
    ///
    /// Unknown keys are registered as gauges with a humanized name. Concurrent
    /// resolution of the same key converges on one row.
    pub async fn resolve(&self, key: &str) -> Result<CatalogEntry, StorageError> {
        if let Some(entry) = self.get(key).await? {
            return Ok(entry);
        }

        let entry = CatalogEntry::auto(key);
        sqlx::query(
            "INSERT INTO metric_catalog (key, name, unit, metric_type, collection_tier, category, active)
             VALUES (?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(&entry.key)
        .bind(&entry.name)
        .bind(entry.unit.as_ref())
        .bind(entry.kind.as_ref())
        .bind(entry.tier.as_ref())
        .bind(entry.category.as_ref())
        .execute(&self.pool)
        .await?;
        tracing::debug!(key, "Auto-registered metric");

        self.get(key).await?.ok_or_else(|| {
            StorageError::Internal(format!("catalog entry '{key}' missing after insert"))
        })
    }

    /// Number of catalog entries.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metric_catalog")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::init_schema;

    async fn store() -> CatalogStore {
        let db = db::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let pool = db.inner().clone();
        init_schema(&pool).await.unwrap();
        CatalogStore::new(pool)
    }

    #[tokio::test]
    async fn test_seed_defaults_is_idempotent() {
        let store = store().await;
        let first = store.seed_defaults().await.unwrap();
        assert_eq!(first, default_catalog().len());
        assert_eq!(store.seed_defaults().await.unwrap(), 0);
        assert_eq!(store.count().await.unwrap(), first as i64);
    }

    #[tokio::test]
    async fn test_resolve_known_counter() {
        let store = store().await;
        store.seed_defaults().await.unwrap();
        let entry = store.resolve("iface.rx_bytes_total").await.unwrap();
        assert!(entry.is_counter());
        assert_eq!(entry.unit, MetricUnit::Bytes);
        assert!(entry.id.is_some());
    }

    #[tokio::test]
    async fn test_resolve_unknown_key_auto_registers() {
        let store = store().await;
        let entry = store.resolve("system.cpu.load_pct").await.unwrap();
        assert_eq!(entry.name, "System Cpu Load Pct");
        assert_eq!(entry.kind, MetricKind::Gauge);

        let again = store.resolve("system.cpu.load_pct").await.unwrap();
        assert_eq!(again.id, entry.id);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolve_single_row() {
        let store = store().await;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.resolve("lte.rssi").await.unwrap().id })
            })
            .collect();
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = store().await;
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
