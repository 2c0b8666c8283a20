//! Device storage and synchronization.
//!
//! Provides device configuration CRUD, sync logic for config-file devices on
//! startup, freshness bookkeeping and the discovered capability record.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::config::DeviceConfig;
use crate::storage::StorageError;
use crate::storage::db;
use crate::storage::types::{DeviceState, millis_to_utc};

/// Device record stored in the database.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Database ID.
    pub id: i64,
    pub device_uid: String,
    pub name: String,
    /// Connection and collection settings.
    pub config: DeviceConfig,
    pub state: DeviceState,
    /// Last successful contact.
    pub last_seen: Option<DateTime<Utc>>,
    /// Last configuration or collection error.
    pub last_error: Option<String>,
}

/// Sync result for config-file devices.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Number of devices added.
    pub added: usize,
    /// Number of devices updated.
    pub updated: usize,
    /// Number of devices no longer in config, now disabled.
    pub disabled: usize,
}

/// Capabilities discovered on a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub routeros_version: String,
    pub routeros_major: i64,
    pub board_name: String,
    pub architecture: String,
    pub identity: String,
    pub serial_number: String,
    pub cpu_count: i64,
    pub total_memory: i64,
    pub total_disk: i64,
    pub supports_rest: bool,
    pub wifi_mode: String,
    /// Feature flags such as `has_bgp`, `has_lte`.
    pub features: BTreeMap<String, bool>,
}

/// Feature flags and their defaults when not reported.
const FEATURE_DEFAULTS: &[(&str, bool)] = &[
    ("has_wireless", false),
    ("has_lte", false),
    ("has_mpls", false),
    ("has_container", false),
    ("has_ipv6", true),
    ("has_bgp", false),
    ("has_ospf", false),
    ("has_ppp", true),
    ("has_hotspot", false),
    ("has_dhcp_server", true),
    ("has_gps", false),
];

fn json_str(caps: &serde_json::Map<String, Value>, key: &str) -> String {
    match caps.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn json_i64(caps: &serde_json::Map<String, Value>, key: &str, default: i64) -> i64 {
    match caps.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn json_bool(caps: &serde_json::Map<String, Value>, key: &str, default: bool) -> bool {
    match caps.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        _ => default,
    }
}

impl Capabilities {
    /// Build from the wire map pushed by a collector.
    ///
    /// Hardware fields use RouterOS names (`board-name`, `total-hdd-space`);
    /// feature flags use `has_*` names.
    pub fn from_wire(caps: &serde_json::Map<String, Value>) -> Self {
        let version = json_str(caps, "version");
        let routeros_major = version
            .split(['.', ' '])
            .next()
            .and_then(|m| m.parse().ok())
            .unwrap_or(7);

        let features = FEATURE_DEFAULTS
            .iter()
            .map(|(name, default)| (name.to_string(), json_bool(caps, name, *default)))
            .collect();

        let wifi_mode = match json_str(caps, "wifi_mode").as_str() {
            "" => "none".to_string(),
            mode => mode.to_string(),
        };

        Self {
            routeros_version: version,
            routeros_major,
            board_name: json_str(caps, "board-name"),
            architecture: json_str(caps, "architecture-name"),
            identity: json_str(caps, "identity"),
            serial_number: json_str(caps, "serial-number"),
            cpu_count: json_i64(caps, "cpu-count", 1),
            total_memory: json_i64(caps, "total-memory", 0),
            total_disk: json_i64(caps, "total-hdd-space", 0),
            supports_rest: json_bool(caps, "supports_rest", false),
            wifi_mode,
            features,
        }
    }

    pub fn has(&self, feature: &str) -> bool {
        self.features.get(feature).copied().unwrap_or(false)
    }
}

type DeviceRow = (
    i64,
    String,
    String,
    String,
    i64,
    String,
    Option<i64>,
    Option<String>,
);

const SELECT_DEVICE: &str = "SELECT id, device_uid, name, config, collection_enabled, state, last_seen, last_error FROM devices";

fn device_from_row(row: DeviceRow) -> Result<DeviceRecord, StorageError> {
    let (id, device_uid, name, config, enabled, state, last_seen, last_error) = row;
    let mut config: DeviceConfig = serde_json::from_str(&config)?;
    // The column is authoritative; sync may disable a device without a config edit.
    config.collection_enabled = enabled != 0;
    Ok(DeviceRecord {
        id,
        device_uid,
        name,
        config,
        state: state.parse().unwrap_or_default(),
        last_seen: last_seen.map(millis_to_utc),
        last_error,
    })
}

/// Device storage facade.
#[derive(Clone)]
pub struct DeviceStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStore").finish_non_exhaustive()
    }
}

impl DeviceStore {
    /// Create a new device store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a device by UID. Returns the record ID.
    ///
    /// Runtime fields (state, last_seen, last_error) survive updates.
    pub async fn upsert(&self, config: &DeviceConfig) -> Result<i64, StorageError> {
        let now = Utc::now().timestamp_millis();
        let config_json = serde_json::to_string(config)?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO devices (device_uid, name, source, config, collection_enabled, created_at, updated_at)
            VALUES (?, ?, 'config', ?, ?, ?, ?)
            ON CONFLICT (device_uid) DO UPDATE SET
                name = excluded.name,
                config = excluded.config,
                collection_enabled = excluded.collection_enabled,
                last_error = CASE WHEN devices.config = excluded.config THEN devices.last_error ELSE NULL END,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&config.device_uid)
        .bind(&config.name)
        .bind(config_json)
        .bind(config.collection_enabled)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Get a device by UID.
    pub async fn get_by_uid(&self, device_uid: &str) -> Result<Option<DeviceRecord>, StorageError> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!("{SELECT_DEVICE} WHERE device_uid = ?"))
            .bind(device_uid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(device_from_row).transpose()
    }

    /// List devices with collection enabled.
    pub async fn list_enabled(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "{SELECT_DEVICE} WHERE collection_enabled = 1 ORDER BY device_uid"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(device_from_row).collect()
    }

    /// List all devices.
    pub async fn list_all(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!("{SELECT_DEVICE} ORDER BY device_uid"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(device_from_row).collect()
    }

    /// Sync config-file devices.
    ///
    /// - Upserts all provided devices
    /// - Disables stored devices missing from the list (never deletes them)
    pub async fn sync_from_config(
        &self,
        configs: &[DeviceConfig],
    ) -> Result<SyncResult, StorageError> {
        let mut result = SyncResult::default();

        let existing: HashSet<String> = self
            .list_all()
            .await?
            .into_iter()
            .map(|d| d.device_uid)
            .collect();
        let wanted: HashSet<&str> = configs.iter().map(|c| c.device_uid.as_str()).collect();

        for config in configs {
            self.upsert(config).await?;
            if existing.contains(&config.device_uid) {
                result.updated += 1;
            } else {
                result.added += 1;
            }
        }

        for uid in existing.iter().filter(|uid| !wanted.contains(uid.as_str())) {
            let rows = sqlx::query(
                "UPDATE devices SET collection_enabled = 0, updated_at = ? WHERE device_uid = ? AND collection_enabled = 1",
            )
            .bind(Utc::now().timestamp_millis())
            .bind(uid)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if rows > 0 {
                result.disabled += 1;
            }
        }

        Ok(result)
    }

    /// Record a successful contact. `last_seen` never moves backwards.
    pub async fn touch_last_seen(
        &self,
        device_id: i64,
        ts: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE devices SET last_seen = MAX(COALESCE(last_seen, 0), ?), state = 'up' WHERE id = ?",
        )
        .bind(ts.timestamp_millis())
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_state(&self, device_id: i64, state: DeviceState) -> Result<(), StorageError> {
        sqlx::query("UPDATE devices SET state = ? WHERE id = ?")
            .bind(state.as_ref())
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set or clear the last error of a device.
    pub async fn set_last_error(
        &self,
        device_uid: &str,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE devices SET last_error = ? WHERE device_uid = ?")
            .bind(error)
            .bind(device_uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store discovered capabilities and mirror REST support into the config.
    pub async fn upsert_capabilities(
        &self,
        device_id: i64,
        caps: &Capabilities,
    ) -> Result<(), StorageError> {
        let now = Utc::now().timestamp_millis();
        let features = serde_json::to_string(&caps.features)?;

        let mut tx = db::begin_write(&self.pool).await?;
        sqlx::query(
            r#"
            INSERT INTO capabilities (device_id, routeros_version, routeros_major, board_name,
                architecture, identity, serial_number, cpu_count, total_memory, total_disk,
                supports_rest, wifi_mode, features, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                routeros_version = excluded.routeros_version,
                routeros_major = excluded.routeros_major,
                board_name = excluded.board_name,
                architecture = excluded.architecture,
                identity = excluded.identity,
                serial_number = excluded.serial_number,
                cpu_count = excluded.cpu_count,
                total_memory = excluded.total_memory,
                total_disk = excluded.total_disk,
                supports_rest = excluded.supports_rest,
                wifi_mode = excluded.wifi_mode,
                features = excluded.features,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(device_id)
        .bind(&caps.routeros_version)
        .bind(caps.routeros_major)
        .bind(&caps.board_name)
        .bind(&caps.architecture)
        .bind(&caps.identity)
        .bind(&caps.serial_number)
        .bind(caps.cpu_count)
        .bind(caps.total_memory)
        .bind(caps.total_disk)
        .bind(caps.supports_rest)
        .bind(&caps.wifi_mode)
        .bind(features)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row: Option<(String,)> = sqlx::query_as("SELECT config FROM devices WHERE id = ?")
            .bind(device_id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some((config_json,)) = row {
            let mut config: DeviceConfig = serde_json::from_str(&config_json)?;
            if config.supports_rest != Some(caps.supports_rest) {
                config.supports_rest = Some(caps.supports_rest);
                sqlx::query("UPDATE devices SET config = ?, updated_at = ? WHERE id = ?")
                    .bind(serde_json::to_string(&config)?)
                    .bind(now)
                    .bind(device_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_capabilities(
        &self,
        device_id: i64,
    ) -> Result<Option<Capabilities>, StorageError> {
        type CapRow = (String, i64, String, String, String, String, i64, i64, i64, bool, String, String);
        let row: Option<CapRow> = sqlx::query_as(
            "SELECT routeros_version, routeros_major, board_name, architecture, identity,
                    serial_number, cpu_count, total_memory, total_disk, supports_rest,
                    wifi_mode, features
             FROM capabilities WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(
            |(
                routeros_version,
                routeros_major,
                board_name,
                architecture,
                identity,
                serial_number,
                cpu_count,
                total_memory,
                total_disk,
                supports_rest,
                wifi_mode,
                features,
            )| {
                Ok(Capabilities {
                    routeros_version,
                    routeros_major,
                    board_name,
                    architecture,
                    identity,
                    serial_number,
                    cpu_count,
                    total_memory,
                    total_disk,
                    supports_rest,
                    wifi_mode,
                    features: serde_json::from_str(&features)?,
                })
            },
        )
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use crate::storage::schema::init_schema;

    async fn store() -> DeviceStore {
        let db = db::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let pool = db.inner().clone();
        init_schema(&pool).await.unwrap();
        DeviceStore::new(pool)
    }

    #[tokio::test]
    async fn test_device_crud() {
        let store = store().await;
        let config = DeviceConfig::new("MT-1", "10.0.0.1").with_credentials("admin", "pw");
        let id = store.upsert(&config).await.unwrap();
        assert!(id > 0);

        let fetched = store.get_by_uid("MT-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.config, config);
        assert_eq!(fetched.state, DeviceState::Unknown);
        assert!(fetched.last_seen.is_none());

        let updated = config.clone().with_port(8729);
        assert_eq!(store.upsert(&updated).await.unwrap(), id);
        let fetched = store.get_by_uid("MT-1").await.unwrap().unwrap();
        assert_eq!(fetched.config.port, Some(8729));

        assert!(store.get_by_uid("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_sync() {
        let store = store().await;

        let configs = vec![
            DeviceConfig::new("A", "10.0.0.1"),
            DeviceConfig::new("B", "10.0.0.2"),
        ];
        let result = store.sync_from_config(&configs).await.unwrap();
        assert_eq!(
            result,
            SyncResult {
                added: 2,
                updated: 0,
                disabled: 0
            }
        );

        let configs = vec![
            DeviceConfig::new("A", "10.0.0.1"),
            DeviceConfig::new("C", "10.0.0.3"),
        ];
        let result = store.sync_from_config(&configs).await.unwrap();
        assert_eq!(
            result,
            SyncResult {
                added: 1,
                updated: 1,
                disabled: 1
            }
        );

        // B is kept but disabled
        assert_eq!(store.list_all().await.unwrap().len(), 3);
        let enabled: Vec<_> = store
            .list_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_uid)
            .collect();
        assert_eq!(enabled, vec!["A", "C"]);
        let b = store.get_by_uid("B").await.unwrap().unwrap();
        assert!(!b.config.collection_enabled);
    }

    #[tokio::test]
    async fn test_touch_last_seen_is_monotonic() {
        let store = store().await;
        let id = store.upsert(&DeviceConfig::new("A", "h")).await.unwrap();
        let now = Utc::now();

        store.touch_last_seen(id, now).await.unwrap();
        store
            .touch_last_seen(id, now - chrono::Duration::seconds(60))
            .await
            .unwrap();

        let device = store.get_by_uid("A").await.unwrap().unwrap();
        assert_eq!(
            device.last_seen.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
        assert_eq!(device.state, DeviceState::Up);

        store.set_state(id, DeviceState::Down).await.unwrap();
        let device = store.get_by_uid("A").await.unwrap().unwrap();
        assert_eq!(device.state, DeviceState::Down);
    }

    #[tokio::test]
    async fn test_last_error_cleared_on_config_change() {
        let store = store().await;
        let config = DeviceConfig::new("A", "h");
        store.upsert(&config).await.unwrap();
        store
            .set_last_error("A", Some("realtime interval 1s is below the minimum of 5s"))
            .await
            .unwrap();

        // Same config keeps the error
        store.upsert(&config).await.unwrap();
        assert!(store.get_by_uid("A").await.unwrap().unwrap().last_error.is_some());

        // A changed config clears it
        store.upsert(&config.with_port(1234)).await.unwrap();
        assert!(store.get_by_uid("A").await.unwrap().unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_capabilities_roundtrip_and_rest_flag() {
        let store = store().await;
        let mut config = DeviceConfig::new("A", "h");
        config.transport = Transport::Auto;
        let id = store.upsert(&config).await.unwrap();

        let wire = serde_json::json!({
            "version": "7.15.3 (stable)",
            "board-name": "CCR2004-1G-12S+2XS",
            "architecture-name": "arm64",
            "cpu-count": "4",
            "total-memory": 4294967296u64,
            "total-hdd-space": "134217728",
            "supports_rest": true,
            "has_bgp": true,
        });
        let caps = Capabilities::from_wire(wire.as_object().unwrap());
        assert_eq!(caps.routeros_major, 7);
        assert_eq!(caps.cpu_count, 4);
        assert_eq!(caps.total_memory, 4_294_967_296);
        assert_eq!(caps.wifi_mode, "none");
        assert!(caps.has("has_bgp"));
        assert!(caps.has("has_ppp"));
        assert!(!caps.has("has_lte"));

        store.upsert_capabilities(id, &caps).await.unwrap();
        store.upsert_capabilities(id, &caps).await.unwrap();

        assert_eq!(store.get_capabilities(id).await.unwrap().unwrap(), caps);
        let device = store.get_by_uid("A").await.unwrap().unwrap();
        assert_eq!(device.config.supports_rest, Some(true));
        assert!(device.config.use_rest());
    }

    #[test]
    fn test_capabilities_defaults() {
        let caps = Capabilities::from_wire(&serde_json::Map::new());
        assert_eq!(caps.routeros_major, 7);
        assert_eq!(caps.cpu_count, 1);
        assert!(!caps.supports_rest);
    }
}
