//! Metric catalog entries and the built-in default catalog.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::config::CollectionTier;

use super::key::humanize_key;

/// Gauge vs. counter classification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MetricKind {
    /// Point-in-time value.
    #[default]
    Gauge,
    /// Monotonically increasing cumulative value; rates are derived from deltas.
    Counter,
}

/// Unit of measure.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MetricUnit {
    Bytes,
    Bps,
    Pps,
    Percent,
    #[default]
    Count,
    Seconds,
    #[strum(serialize = "ms")]
    #[serde(rename = "ms")]
    Milliseconds,
    Celsius,
    Dbm,
    Text,
}

/// Metric category, used for grouping.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MetricCategory {
    System,
    Interface,
    Routing,
    Firewall,
    Wireless,
    Lte,
    Dhcp,
    Ppp,
    Queue,
    #[default]
    Other,
}

impl MetricCategory {
    /// Infer the category from a key's first segment.
    pub fn for_key(key: &str) -> Self {
        match key.split('.').next().unwrap_or_default() {
            "system" | "ping" => Self::System,
            "iface" => Self::Interface,
            "routing" | "bgp" | "ospf" | "arp" => Self::Routing,
            "firewall" => Self::Firewall,
            "wireless" => Self::Wireless,
            "lte" => Self::Lte,
            "dhcp" => Self::Dhcp,
            "ppp" | "hotspot" => Self::Ppp,
            "queue" => Self::Queue,
            _ => Self::Other,
        }
    }
}

/// A metric catalog entry. `key` is globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Database ID (None before insertion).
    pub id: Option<i64>,
    pub key: String,
    pub name: String,
    pub unit: MetricUnit,
    pub kind: MetricKind,
    pub tier: CollectionTier,
    pub category: MetricCategory,
    pub expected_min: Option<f64>,
    pub expected_max: Option<f64>,
    pub active: bool,
}

impl CatalogEntry {
    /// Create a gauge entry with explicit metadata.
    pub fn new(key: impl Into<String>, name: impl Into<String>, unit: MetricUnit) -> Self {
        let key = key.into();
        Self {
            id: None,
            category: MetricCategory::for_key(&key),
            key,
            name: name.into(),
            unit,
            kind: MetricKind::Gauge,
            tier: CollectionTier::T1,
            expected_min: None,
            expected_max: None,
            active: true,
        }
    }

    /// Entry for an unknown key: a gauge with a humanized display name.
    pub fn auto(key: impl Into<String>) -> Self {
        let key = key.into();
        let name = humanize_key(&key);
        Self::new(key, name, MetricUnit::Count)
    }

    pub fn counter(mut self) -> Self {
        self.kind = MetricKind::Counter;
        self
    }

    pub fn with_tier(mut self, tier: CollectionTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.expected_min = Some(min);
        self.expected_max = Some(max);
        self
    }

    pub fn is_counter(&self) -> bool {
        self.kind == MetricKind::Counter
    }
}

/// The catalog seeded into a fresh database.
pub fn default_catalog() -> Vec<CatalogEntry> {
    use MetricUnit::*;

    vec![
        // System
        CatalogEntry::new("system.cpu.load_pct", "CPU Load %", Percent).with_range(0.0, 100.0),
        CatalogEntry::new("system.mem.used_bytes", "Memory Used", Bytes),
        CatalogEntry::new("system.mem.free_bytes", "Memory Free", Bytes),
        CatalogEntry::new("system.memory.used_pct", "Memory Used %", Percent)
            .with_range(0.0, 100.0),
        CatalogEntry::new("system.disk.free_bytes", "Disk Free", Bytes),
        CatalogEntry::new("system.uptime_sec", "Uptime", Seconds),
        CatalogEntry::new("system.temperature", "Temperature", Celsius),
        CatalogEntry::new("system.user_count", "Local Users", Count),
        CatalogEntry::new("ping.rtt_ms", "Ping Latency", Milliseconds),
        CatalogEntry::new("ping.loss_pct", "Ping Loss %", Percent).with_range(0.0, 100.0),
        // Interface
        CatalogEntry::new("iface.rx_bytes_total", "RX Bytes Total", Bytes).counter(),
        CatalogEntry::new("iface.tx_bytes_total", "TX Bytes Total", Bytes).counter(),
        CatalogEntry::new("iface.rx_packets_total", "RX Packets Total", Count).counter(),
        CatalogEntry::new("iface.tx_packets_total", "TX Packets Total", Count).counter(),
        CatalogEntry::new("iface.rx_bps", "RX Rate", Bps).with_tier(CollectionTier::T0),
        CatalogEntry::new("iface.tx_bps", "TX Rate", Bps).with_tier(CollectionTier::T0),
        CatalogEntry::new("iface.rx_pps", "RX Packet Rate", Pps).with_tier(CollectionTier::T0),
        CatalogEntry::new("iface.tx_pps", "TX Packet Rate", Pps).with_tier(CollectionTier::T0),
        CatalogEntry::new("iface.rx_errors", "RX Errors", Count).counter(),
        CatalogEntry::new("iface.tx_errors", "TX Errors", Count).counter(),
        // Firewall
        CatalogEntry::new("firewall.conntrack_count", "Conntrack Entries", Count),
        CatalogEntry::new("firewall.filter_rule_count", "Filter Rules", Count)
            .with_tier(CollectionTier::T2),
        CatalogEntry::new("firewall.nat_rule_count", "NAT Rules", Count)
            .with_tier(CollectionTier::T2),
        // Routing
        CatalogEntry::new("routing.route_count", "Routes", Count).with_tier(CollectionTier::T2),
        CatalogEntry::new("routing.active_route_count", "Active Routes", Count)
            .with_tier(CollectionTier::T2),
        CatalogEntry::new("arp.entry_count", "ARP Entries", Count).with_tier(CollectionTier::T2),
        CatalogEntry::new("bgp.peer_count", "BGP Peers", Count).with_tier(CollectionTier::T2),
        CatalogEntry::new("bgp.established_count", "BGP Established", Count)
            .with_tier(CollectionTier::T2),
        CatalogEntry::new("ospf.neighbor_count", "OSPF Neighbors", Count)
            .with_tier(CollectionTier::T2),
        CatalogEntry::new("ospf.full_count", "OSPF Full Adjacencies", Count)
            .with_tier(CollectionTier::T2),
        CatalogEntry::new("queue.simple_count", "Simple Queues", Count),
        // Wireless / LTE
        CatalogEntry::new("wireless.client_count", "Wireless Clients", Count),
        CatalogEntry::new("lte.rsrp", "LTE RSRP", Dbm),
        CatalogEntry::new("lte.rsrq", "LTE RSRQ", Dbm),
        CatalogEntry::new("lte.sinr", "LTE SINR", Dbm),
        // DHCP / PPP
        CatalogEntry::new("dhcp.active_leases", "Active DHCP Leases", Count),
        CatalogEntry::new("ppp.active_sessions", "Active PPP Sessions", Count),
        CatalogEntry::new("hotspot.active_users", "Active Hotspot Users", Count),
    ]
}
