//! Core data types for the storage layer.
//!
//! - [`MetricPoint`]: Append-only metric fact (numeric or text value)
//! - [`Event`]: Structured device event records
//! - [`EventType`] / [`EventSeverity`]: Event classification
//! - [`DeviceState`]: Freshness-derived device health

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::metric::MetricValue;

/// A device with no successful contact for this long is degraded.
pub const DEGRADED_AFTER: Duration = Duration::from_secs(30);

/// A device with no successful contact for this long is down.
pub const DOWN_AFTER: Duration = Duration::from_secs(120);

/// Convert stored Unix milliseconds back into a timestamp.
pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// =============================================================================
// Device state
// =============================================================================

/// Health state of a monitored device as seen by the backend.
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
pub enum DeviceState {
    /// Never seen.
    #[default]
    Unknown,
    /// Successful contact within [`DEGRADED_AFTER`].
    Up,
    /// Last contact between [`DEGRADED_AFTER`] and [`DOWN_AFTER`] ago.
    Degraded,
    /// Last contact more than [`DOWN_AFTER`] ago.
    Down,
}

impl DeviceState {
    /// Derive the state from the freshness of the last successful contact.
    pub fn from_last_seen(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(seen) = last_seen else {
            return Self::Unknown;
        };
        // Clock skew can put last_seen slightly in the future; that is fresh.
        let age = (now - seen).to_std().unwrap_or(Duration::ZERO);
        if age > DOWN_AFTER {
            Self::Down
        } else if age > DEGRADED_AFTER {
            Self::Degraded
        } else {
            Self::Up
        }
    }
}

// =============================================================================
// Metric points
// =============================================================================

/// An immutable metric observation stored in `metric_points`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub device_id: i64,
    pub metric_id: i64,
    /// Canonical base key (interface name already split off).
    pub metric_key: String,
    /// Interface name for interface-scoped metrics.
    pub interface: Option<String>,
    pub ts_collected: DateTime<Utc>,
    pub ts_received: DateTime<Utc>,
    pub value: MetricValue,
}

// =============================================================================
// Events
// =============================================================================

/// A device event stored in the `events` table. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Auto-generated event identifier.
    pub id: Option<i64>,
    /// Device the event belongs to.
    pub device_id: i64,
    /// Event timestamp (UTC).
    pub ts: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: EventSeverity,
    /// What the event is about (interface name, peer, user).
    pub subject: Option<String>,
    pub message: Option<String>,
    /// Event origin (e.g., "collector", "health").
    pub source: String,
    /// Structured context.
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(
        device_id: i64,
        event_type: EventType,
        severity: EventSeverity,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            device_id,
            ts: Utc::now(),
            event_type,
            severity,
            subject: None,
            message: None,
            source: source.into(),
            data: None,
        }
    }

    pub fn with_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Event type classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EventType {
    DeviceUp,
    DeviceDown,
    DeviceDegraded,
    InterfaceUp,
    InterfaceDown,
    BgpEstablished,
    BgpDown,
    OspfFull,
    OspfDown,
    PppConnect,
    PppDisconnect,
    HotspotLogin,
    HotspotLogout,
    DhcpLease,
    DhcpExpire,
    LoginFailure,
    ConfigChange,
    Reboot,
    Error,
    Warning,
    Info,
}

impl EventType {
    /// Parse leniently; unknown values become [`EventType::Info`].
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self::Info)
    }
}

/// Event severity classification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventSeverity {
    /// Normal operational information.
    #[default]
    Info,
    /// Potential issue that may require attention.
    Warning,
    /// Error condition requiring investigation.
    Error,
    /// Severe failure requiring immediate action.
    Critical,
}

impl EventSeverity {
    /// Parse leniently; unknown values become [`EventSeverity::Info`].
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}
