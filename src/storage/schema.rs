//! Database schema definitions.
//!
//! Timestamps are stored as Unix milliseconds (`INTEGER`). Current-state
//! tables (latest, interfaces, leases, sessions) carry the uniqueness
//! constraints their upserts rely on.

use sqlx::SqlitePool;

use crate::storage::StorageError;

/// Devices under management, including connection parameters.
pub const DEVICES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    device_uid         TEXT NOT NULL UNIQUE,
    name               TEXT NOT NULL DEFAULT '',
    source             TEXT NOT NULL DEFAULT 'config',
    config             TEXT NOT NULL,
    collection_enabled INTEGER NOT NULL DEFAULT 1,
    state              TEXT NOT NULL DEFAULT 'unknown',
    last_seen          INTEGER,
    last_error         TEXT,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL
);
"#;

/// Discovered device capabilities (one row per device).
pub const CAPABILITIES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS capabilities (
    device_id        INTEGER PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
    routeros_version TEXT NOT NULL DEFAULT '',
    routeros_major   INTEGER NOT NULL DEFAULT 0,
    board_name       TEXT NOT NULL DEFAULT '',
    architecture     TEXT NOT NULL DEFAULT '',
    identity         TEXT NOT NULL DEFAULT '',
    serial_number    TEXT NOT NULL DEFAULT '',
    cpu_count        INTEGER NOT NULL DEFAULT 1,
    total_memory     INTEGER NOT NULL DEFAULT 0,
    total_disk       INTEGER NOT NULL DEFAULT 0,
    supports_rest    INTEGER NOT NULL DEFAULT 0,
    wifi_mode        TEXT NOT NULL DEFAULT 'none',
    features         TEXT NOT NULL DEFAULT '{}',
    updated_at       INTEGER NOT NULL
);
"#;

/// Metric catalog. Keys are globally unique.
pub const METRIC_CATALOG_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS metric_catalog (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    key             TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    unit            TEXT NOT NULL DEFAULT 'count',
    metric_type     TEXT NOT NULL DEFAULT 'gauge',
    collection_tier TEXT NOT NULL DEFAULT 't1',
    category        TEXT NOT NULL DEFAULT 'other',
    expected_min    REAL,
    expected_max    REAL,
    active          INTEGER NOT NULL DEFAULT 1
);
"#;

/// Append-only metric facts, read most-recent-first per device.
pub const METRIC_POINTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS metric_points (
    device_id      INTEGER NOT NULL,
    metric_id      INTEGER NOT NULL,
    interface_name TEXT,
    ts_collected   INTEGER NOT NULL,
    ts_received    INTEGER NOT NULL,
    value_float    REAL,
    value_text     TEXT
);
CREATE INDEX IF NOT EXISTS idx_metric_points_device_ts
    ON metric_points (device_id, ts_collected DESC);
CREATE INDEX IF NOT EXISTS idx_metric_points_metric_ts
    ON metric_points (metric_id, ts_collected DESC);
"#;

/// Latest value per (device, metric, interface). `''` is device-level.
pub const METRIC_LATEST_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS metric_latest (
    device_id      INTEGER NOT NULL,
    metric_key     TEXT NOT NULL,
    interface_name TEXT NOT NULL DEFAULT '',
    value_float    REAL,
    value_text     TEXT,
    ts_collected   INTEGER NOT NULL,
    prev_value     REAL,
    prev_ts        INTEGER,
    UNIQUE (device_id, metric_key, interface_name)
);
"#;

/// Append-only device events.
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id  INTEGER NOT NULL,
    ts         INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    severity   TEXT NOT NULL,
    subject    TEXT,
    message    TEXT,
    source     TEXT NOT NULL,
    data       TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_device_ts ON events (device_id, ts DESC);
"#;

/// Interface inventory, upserted by name.
pub const INTERFACES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS interfaces (
    device_id       INTEGER NOT NULL,
    name            TEXT NOT NULL,
    interface_type  TEXT NOT NULL DEFAULT 'other',
    enabled         INTEGER NOT NULL DEFAULT 1,
    running         INTEGER NOT NULL DEFAULT 0,
    mac_address     TEXT,
    mtu             INTEGER NOT NULL DEFAULT 1500,
    comment         TEXT,
    is_uplink       INTEGER NOT NULL DEFAULT 0,
    is_sla          INTEGER NOT NULL DEFAULT 0,
    t0_enabled      INTEGER NOT NULL DEFAULT 0,
    collection_tier TEXT NOT NULL DEFAULT 'auto',
    last_seen       INTEGER NOT NULL,
    UNIQUE (device_id, name)
);
"#;

/// DHCP leases, upserted by address.
pub const LEASES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    device_id   INTEGER NOT NULL,
    address     TEXT NOT NULL,
    mac_address TEXT,
    client_id   TEXT,
    host_name   TEXT,
    server      TEXT,
    status      TEXT NOT NULL DEFAULT 'bound',
    is_static   INTEGER NOT NULL DEFAULT 0,
    last_seen   INTEGER NOT NULL,
    UNIQUE (device_id, address)
);
"#;

/// PPP/hotspot sessions, upserted by (type, username).
pub const SESSIONS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    device_id    INTEGER NOT NULL,
    session_type TEXT NOT NULL,
    username     TEXT NOT NULL,
    address      TEXT,
    caller_id    TEXT,
    service      TEXT,
    interface    TEXT,
    uptime_sec   INTEGER NOT NULL DEFAULT 0,
    bytes_in     INTEGER NOT NULL DEFAULT 0,
    bytes_out    INTEGER NOT NULL DEFAULT 0,
    active       INTEGER NOT NULL DEFAULT 1,
    last_seen    INTEGER NOT NULL,
    UNIQUE (device_id, session_type, username)
);
"#;

/// Initialize the database schema.
///
/// Creates all tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in [
        DEVICES_TABLE_DDL,
        CAPABILITIES_TABLE_DDL,
        METRIC_CATALOG_TABLE_DDL,
        METRIC_POINTS_TABLE_DDL,
        METRIC_LATEST_TABLE_DDL,
        EVENTS_TABLE_DDL,
        INTERFACES_TABLE_DDL,
        LEASES_TABLE_DDL,
        SESSIONS_TABLE_DDL,
    ] {
        sqlx::raw_sql(ddl).execute(pool).await?;
    }
    tracing::debug!("Schema initialized");
    Ok(())
}
