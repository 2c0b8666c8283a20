//! JSON wire contract between collectors and the backend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::DeviceConfig;
use crate::ingest::auth::{AuthError, sign};
use crate::metric::MetricMap;
use crate::storage::RawRecord;

/// Accept the timestamp as a string or a bare number.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Authentication fields carried by every collector request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub collector_id: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
}

impl Envelope {
    /// Stamp with the current Unix time and sign when a secret is given.
    pub fn signed(collector_id: &str, secret: Option<&str>) -> Result<Self, AuthError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = match secret {
            Some(secret) if !secret.is_empty() => sign(secret, collector_id, &timestamp)?,
            _ => String::new(),
        };
        Ok(Self {
            collector_id: collector_id.to_string(),
            signature,
            timestamp,
        })
    }
}

/// Metrics of one device from one poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub device_uid: String,
    /// Collection time; the receipt time is used when absent.
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
}

impl DeviceMetrics {
    pub fn new(device_uid: impl Into<String>, ts: DateTime<Utc>, metrics: &MetricMap) -> Self {
        Self {
            device_uid: device_uid.into(),
            ts: Some(ts),
            metrics: metrics.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default)]
    pub devices: Vec<DeviceMetrics>,
}

/// An event as reported by a collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub device_uid: String,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfacesRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub device_uid: String,
    #[serde(default)]
    pub interfaces: Vec<RawRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeasesRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub device_uid: String,
    #[serde(default)]
    pub leases: Vec<RawRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub device_uid: String,
    pub session_type: String,
    #[serde(default)]
    pub sessions: Vec<RawRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default)]
    pub capabilities: serde_json::Map<String, Value>,
}

/// Per-device failure inside a metrics batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceError {
    pub device_uid: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub success: bool,
    #[serde(default)]
    pub metrics_processed: usize,
    #[serde(default)]
    pub rates_suppressed: usize,
    #[serde(default)]
    pub errors: Option<Vec<DeviceError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsResponse {
    pub success: bool,
    #[serde(default)]
    pub events_created: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfacesResponse {
    pub success: bool,
    #[serde(default)]
    pub interfaces_synced: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeasesResponse {
    pub success: bool,
    #[serde(default)]
    pub leases_synced: usize,
    #[serde(default)]
    pub active_leases: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub success: bool,
    #[serde(default)]
    pub sessions_synced: usize,
    #[serde(default)]
    pub active_sessions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub success: bool,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Generic `{success, error}` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metrics_request_flattened_envelope() {
        let body = json!({
            "collector_id": "collector-01",
            "signature": "abc",
            "timestamp": 1700000000,
            "devices": [
                {"device_uid": "r1", "ts": "2024-01-01T00:00:00Z", "metrics": {"system.cpu.load_pct": 12}},
                {"device_uid": "r2", "metrics": {}}
            ]
        });
        let req: MetricsRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.envelope.collector_id, "collector-01");
        assert_eq!(req.envelope.timestamp, "1700000000");
        assert_eq!(req.devices.len(), 2);
        assert!(req.devices[0].ts.is_some());
        assert!(req.devices[1].ts.is_none());
    }

    #[test]
    fn test_missing_signature_defaults_empty() {
        let req: DevicesRequest =
            serde_json::from_value(json!({"collector_id": "c", "timestamp": "1"})).unwrap();
        assert!(req.envelope.signature.is_empty());
    }

    #[test]
    fn test_device_metrics_from_map() {
        let mut map = MetricMap::new();
        map.insert("system.cpu.load_pct".into(), 5.0.into());
        map.insert("system.version".into(), "7.15".into());
        let dm = DeviceMetrics::new("r1", Utc::now(), &map);
        assert_eq!(dm.metrics["system.cpu.load_pct"], json!(5.0));
        assert_eq!(dm.metrics["system.version"], json!("7.15"));
    }

    #[test]
    fn test_metrics_response_serializes_null_errors() {
        let resp = MetricsResponse {
            success: true,
            metrics_processed: 3,
            ..Default::default()
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["errors"], Value::Null);
        assert!(v.get("error").is_none());
    }
}
