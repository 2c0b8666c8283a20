//! Current-state inventory: interfaces, DHCP leases and PPP/hotspot sessions.
//!
//! Every sync is full-replace: rows in the payload are upserted by key and
//! refreshed, rows missing from it are marked disabled, expired or inactive.
//! Nothing is deleted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::config::{DeviceConfig, InterfaceTier};
use crate::metric::parse::{parse_bool, parse_number, parse_text, parse_uptime};
use crate::storage::StorageError;
use crate::storage::db;
use crate::storage::types::millis_to_utc;

/// A raw inventory row as produced by the router, keyed by field name.
pub type RawRecord = serde_json::Map<String, Value>;

const DEFAULT_MTU: i64 = 1500;

fn text(rec: &RawRecord, key: &str) -> Option<String> {
    rec.get(key).and_then(parse_text)
}

fn flag(rec: &RawRecord, key: &str) -> Option<bool> {
    rec.get(key).and_then(parse_bool)
}

/// Map a RouterOS interface type to the inventory classification.
pub fn interface_type(ros_type: &str) -> &'static str {
    match ros_type {
        "ether" => "ether",
        "wlan" => "wlan",
        "bridge" => "bridge",
        "vlan" => "vlan",
        "bonding" => "bond",
        "pppoe-out" => "pppoe-client",
        "pppoe-in" => "pppoe-server",
        "l2tp-out" | "l2tp-in" => "l2tp",
        "sstp-out" | "sstp-in" => "sstp",
        "ovpn-out" | "ovpn-in" => "ovpn",
        "wireguard" => "wireguard",
        "gre-tunnel" => "gre",
        "eoip-tunnel" => "eoip",
        "vxlan" => "vxlan",
        "lte" => "lte",
        _ => "other",
    }
}

/// Map a RouterOS lease status; anything unknown counts as bound.
pub fn lease_status(ros_status: &str) -> &'static str {
    match ros_status {
        "waiting" => "waiting",
        "offered" => "offered",
        _ => "bound",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceRecord {
    pub name: String,
    pub interface_type: String,
    pub enabled: bool,
    pub running: bool,
    pub mac_address: Option<String>,
    pub mtu: i64,
    pub comment: Option<String>,
    pub is_uplink: bool,
    pub is_sla: bool,
    pub t0_enabled: bool,
    /// `auto`, `t0`, `t1` or `t2`.
    pub collection_tier: String,
    pub last_seen: DateTime<Utc>,
}

impl InterfaceRecord {
    /// Normalize a raw row. Returns None when the row has no name.
    ///
    /// Uplink, SLA and tier override come from `device` first, then from the
    /// row itself.
    pub fn from_raw(rec: &RawRecord, device: &DeviceConfig, now: DateTime<Utc>) -> Option<Self> {
        let name = text(rec, "name")?;
        let enabled = flag(rec, "is_enabled")
            .or_else(|| flag(rec, "disabled").map(|d| !d))
            .unwrap_or(true);
        let running = flag(rec, "is_running")
            .or_else(|| flag(rec, "running"))
            .unwrap_or(false);
        let mac_address = text(rec, "mac_address").or_else(|| text(rec, "mac-address"));
        let mtu = rec
            .get("mtu")
            .and_then(parse_number)
            .filter(|m| *m > 0.0 && m.fract() == 0.0)
            .map(|m| m as i64)
            .unwrap_or(DEFAULT_MTU);

        Some(Self {
            interface_type: interface_type(&text(rec, "type").unwrap_or_default()).to_string(),
            enabled,
            running,
            mac_address,
            mtu,
            comment: text(rec, "comment"),
            is_uplink: device.uplink_interfaces.contains(&name)
                || flag(rec, "is_uplink").unwrap_or(false),
            is_sla: device.sla_interfaces.contains(&name) || flag(rec, "is_sla").unwrap_or(false),
            t0_enabled: flag(rec, "t0_enabled").unwrap_or(false),
            collection_tier: match device.interface_tier(&name) {
                InterfaceTier::Auto => text(rec, "collection_tier")
                    .and_then(|t| t.parse::<InterfaceTier>().ok())
                    .unwrap_or_default(),
                tier => tier,
            }
            .to_string(),
            last_seen: now,
            name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseRecord {
    pub address: String,
    pub mac_address: Option<String>,
    pub client_id: Option<String>,
    pub host_name: Option<String>,
    pub server: Option<String>,
    pub status: String,
    pub is_static: bool,
    pub last_seen: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn from_raw(rec: &RawRecord, now: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            address: text(rec, "address")?,
            mac_address: text(rec, "mac-address"),
            client_id: text(rec, "client-id"),
            host_name: text(rec, "host-name"),
            server: text(rec, "server"),
            status: lease_status(&text(rec, "status").unwrap_or_default()).to_string(),
            is_static: flag(rec, "dynamic") == Some(false),
            last_seen: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_type: String,
    pub username: String,
    pub address: Option<String>,
    pub caller_id: Option<String>,
    pub service: Option<String>,
    pub interface: Option<String>,
    pub uptime_sec: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub active: bool,
    pub last_seen: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_raw(rec: &RawRecord, session_type: &str, now: DateTime<Utc>) -> Option<Self> {
        let username = text(rec, "name").or_else(|| text(rec, "user"))?;
        let bytes = |key: &str| rec.get(key).and_then(parse_number).unwrap_or(0.0) as i64;
        Some(Self {
            session_type: session_type.to_string(),
            username,
            address: text(rec, "address"),
            caller_id: text(rec, "caller-id"),
            service: text(rec, "service").or_else(|| text(rec, "profile")),
            interface: text(rec, "interface"),
            uptime_sec: parse_uptime(&text(rec, "uptime").unwrap_or_default()) as i64,
            bytes_in: bytes("bytes-in"),
            bytes_out: bytes("bytes-out"),
            active: true,
            last_seen: now,
        })
    }
}

/// Inventory facade.
#[derive(Clone)]
pub struct InventoryStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for InventoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryStore").finish_non_exhaustive()
    }
}

impl InventoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Sync the interface inventory. Returns the number of rows upserted.
    pub async fn sync_interfaces(
        &self,
        device_id: i64,
        rows: &[RawRecord],
        device: &DeviceConfig,
    ) -> Result<usize, StorageError> {
        let now = Utc::now();
        let records: Vec<_> = rows
            .iter()
            .filter_map(|r| InterfaceRecord::from_raw(r, device, now))
            .collect();

        let mut tx = db::begin_write(&self.pool).await?;
        for r in &records {
            sqlx::query(
                r#"
                INSERT INTO interfaces (device_id, name, interface_type, enabled, running, mac_address,
                    mtu, comment, is_uplink, is_sla, t0_enabled, collection_tier, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (device_id, name) DO UPDATE SET
                    interface_type = excluded.interface_type,
                    enabled = excluded.enabled,
                    running = excluded.running,
                    mac_address = excluded.mac_address,
                    mtu = excluded.mtu,
                    comment = excluded.comment,
                    is_uplink = excluded.is_uplink,
                    is_sla = excluded.is_sla,
                    t0_enabled = excluded.t0_enabled,
                    collection_tier = excluded.collection_tier,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(device_id)
            .bind(&r.name)
            .bind(&r.interface_type)
            .bind(r.enabled)
            .bind(r.running)
            .bind(r.mac_address.as_deref())
            .bind(r.mtu)
            .bind(r.comment.as_deref())
            .bind(r.is_uplink)
            .bind(r.is_sla)
            .bind(r.t0_enabled)
            .bind(&r.collection_tier)
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        let seen: HashSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM interfaces WHERE device_id = ?")
                .bind(device_id)
                .fetch_all(&mut *tx)
                .await?;
        for (name,) in existing.iter().filter(|(n,)| !seen.contains(n.as_str())) {
            sqlx::query(
                "UPDATE interfaces SET enabled = 0, running = 0, t0_enabled = 0 WHERE device_id = ? AND name = ?",
            )
            .bind(device_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(records.len())
    }

    /// Sync DHCP leases. Returns the number of rows upserted.
    pub async fn sync_leases(&self, device_id: i64, rows: &[RawRecord]) -> Result<usize, StorageError> {
        let now = Utc::now();
        let records: Vec<_> = rows
            .iter()
            .filter_map(|r| LeaseRecord::from_raw(r, now))
            .collect();

        let mut tx = db::begin_write(&self.pool).await?;
        for r in &records {
            sqlx::query(
                r#"
                INSERT INTO leases (device_id, address, mac_address, client_id, host_name, server,
                    status, is_static, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (device_id, address) DO UPDATE SET
                    mac_address = excluded.mac_address,
                    client_id = excluded.client_id,
                    host_name = excluded.host_name,
                    server = excluded.server,
                    status = excluded.status,
                    is_static = excluded.is_static,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(device_id)
            .bind(&r.address)
            .bind(r.mac_address.as_deref())
            .bind(r.client_id.as_deref())
            .bind(r.host_name.as_deref())
            .bind(r.server.as_deref())
            .bind(&r.status)
            .bind(r.is_static)
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        let seen: HashSet<&str> = records.iter().map(|r| r.address.as_str()).collect();
        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT address FROM leases WHERE device_id = ? AND status != 'expired'")
                .bind(device_id)
                .fetch_all(&mut *tx)
                .await?;
        for (address,) in existing.iter().filter(|(a,)| !seen.contains(a.as_str())) {
            sqlx::query("UPDATE leases SET status = 'expired' WHERE device_id = ? AND address = ?")
                .bind(device_id)
                .bind(address)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(records.len())
    }

    /// Sync sessions of one type. Returns the number of rows upserted.
    pub async fn sync_sessions(
        &self,
        device_id: i64,
        session_type: &str,
        rows: &[RawRecord],
    ) -> Result<usize, StorageError> {
        let now = Utc::now();
        let records: Vec<_> = rows
            .iter()
            .filter_map(|r| SessionRecord::from_raw(r, session_type, now))
            .collect();

        let mut tx = db::begin_write(&self.pool).await?;
        for r in &records {
            sqlx::query(
                r#"
                INSERT INTO sessions (device_id, session_type, username, address, caller_id, service,
                    interface, uptime_sec, bytes_in, bytes_out, active, last_seen)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
                ON CONFLICT (device_id, session_type, username) DO UPDATE SET
                    address = excluded.address,
                    caller_id = excluded.caller_id,
                    service = excluded.service,
                    interface = excluded.interface,
                    uptime_sec = excluded.uptime_sec,
                    bytes_in = excluded.bytes_in,
                    bytes_out = excluded.bytes_out,
                    active = 1,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(device_id)
            .bind(session_type)
            .bind(&r.username)
            .bind(r.address.as_deref())
            .bind(r.caller_id.as_deref())
            .bind(r.service.as_deref())
            .bind(r.interface.as_deref())
            .bind(r.uptime_sec)
            .bind(r.bytes_in)
            .bind(r.bytes_out)
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        let seen: HashSet<&str> = records.iter().map(|r| r.username.as_str()).collect();
        let existing: Vec<(String,)> = sqlx::query_as(
            "SELECT username FROM sessions WHERE device_id = ? AND session_type = ? AND active = 1",
        )
        .bind(device_id)
        .bind(session_type)
        .fetch_all(&mut *tx)
        .await?;
        for (username,) in existing.iter().filter(|(u,)| !seen.contains(u.as_str())) {
            sqlx::query(
                "UPDATE sessions SET active = 0 WHERE device_id = ? AND session_type = ? AND username = ?",
            )
            .bind(device_id)
            .bind(session_type)
            .bind(username)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(records.len())
    }

    pub async fn list_interfaces(&self, device_id: i64) -> Result<Vec<InterfaceRecord>, StorageError> {
        type Row = (String, String, bool, bool, Option<String>, i64, Option<String>, bool, bool, bool, String, i64);
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT name, interface_type, enabled, running, mac_address, mtu, comment,
                    is_uplink, is_sla, t0_enabled, collection_tier, last_seen
             FROM interfaces WHERE device_id = ? ORDER BY name",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(name, interface_type, enabled, running, mac_address, mtu, comment, is_uplink, is_sla, t0_enabled, collection_tier, last_seen)| {
                    InterfaceRecord {
                        name,
                        interface_type,
                        enabled,
                        running,
                        mac_address,
                        mtu,
                        comment,
                        is_uplink,
                        is_sla,
                        t0_enabled,
                        collection_tier,
                        last_seen: millis_to_utc(last_seen),
                    }
                },
            )
            .collect())
    }

    pub async fn list_leases(&self, device_id: i64) -> Result<Vec<LeaseRecord>, StorageError> {
        type Row = (String, Option<String>, Option<String>, Option<String>, Option<String>, String, bool, i64);
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT address, mac_address, client_id, host_name, server, status, is_static, last_seen
             FROM leases WHERE device_id = ? ORDER BY address",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(address, mac_address, client_id, host_name, server, status, is_static, last_seen)| {
                    LeaseRecord {
                        address,
                        mac_address,
                        client_id,
                        host_name,
                        server,
                        status,
                        is_static,
                        last_seen: millis_to_utc(last_seen),
                    }
                },
            )
            .collect())
    }

    pub async fn list_sessions(
        &self,
        device_id: i64,
        session_type: Option<&str>,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        type Row = (
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
            i64,
            i64,
            bool,
            i64,
        );
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT session_type, username, address, caller_id, service, interface,
                    uptime_sec, bytes_in, bytes_out, active, last_seen
             FROM sessions WHERE device_id = ? AND (? IS NULL OR session_type = ?)
             ORDER BY session_type, username",
        )
        .bind(device_id)
        .bind(session_type)
        .bind(session_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(session_type, username, address, caller_id, service, interface, uptime_sec, bytes_in, bytes_out, active, last_seen)| {
                    SessionRecord {
                        session_type,
                        username,
                        address,
                        caller_id,
                        service,
                        interface,
                        uptime_sec,
                        bytes_in,
                        bytes_out,
                        active,
                        last_seen: millis_to_utc(last_seen),
                    }
                },
            )
            .collect())
    }
}
