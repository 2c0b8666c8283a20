//! Tagged metric values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Metrics keyed by wire key, as produced by one tier poll.
pub type MetricMap = BTreeMap<String, MetricValue>;

/// A metric sample value: numeric, or text for things like firmware versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Numeric(f64),
    Text(String),
}

impl MetricValue {
    /// Convert a loosely-typed JSON value.
    ///
    /// Numbers and booleans become numeric, strings stay text. Nested
    /// structures are kept as their JSON text. `null` has no value.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Numeric(if *b { 1.0 } else { 0.0 })),
            Value::Number(n) => n.as_f64().map(Self::Numeric),
            Value::String(s) => Some(Self::Text(s.clone())),
            other => Some(Self::Text(other.to_string())),
        }
    }

    /// Convert to JSON for the wire.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Numeric(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Numeric(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Numeric(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Numeric(v as f64)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        Self::Numeric(v as f64)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        Self::Numeric(v as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_variants() {
        assert_eq!(
            MetricValue::from_json(&json!(23.5)),
            Some(MetricValue::Numeric(23.5))
        );
        assert_eq!(
            MetricValue::from_json(&json!(4312332)),
            Some(MetricValue::Numeric(4312332.0))
        );
        assert_eq!(
            MetricValue::from_json(&json!(true)),
            Some(MetricValue::Numeric(1.0))
        );
        assert_eq!(
            MetricValue::from_json(&json!("7.14.2")),
            Some(MetricValue::Text("7.14.2".into()))
        );
        assert_eq!(MetricValue::from_json(&json!(null)), None);
        assert_eq!(
            MetricValue::from_json(&json!({"a": 1})),
            Some(MetricValue::Text("{\"a\":1}".into()))
        );
    }

    #[test]
    fn test_untagged_serde() {
        let parsed: MetricValue = serde_json::from_str("12").unwrap();
        assert_eq!(parsed, MetricValue::Numeric(12.0));
        let parsed: MetricValue = serde_json::from_str("\"up\"").unwrap();
        assert_eq!(parsed, MetricValue::Text("up".into()));
        assert_eq!(serde_json::to_string(&MetricValue::Numeric(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn test_accessors() {
        let v = MetricValue::from(42_i64);
        assert_eq!(v.as_f64(), Some(42.0));
        assert_eq!(v.as_text(), None);
        assert_eq!(MetricValue::from("x").as_text(), Some("x"));
        assert_eq!(MetricValue::Numeric(f64::NAN).to_json(), serde_json::Value::Null);
    }
}
