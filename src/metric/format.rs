//! Human-readable value formatting for snapshots.

use super::{MetricUnit, MetricValue};

const BYTE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
const BIT_RATE_UNITS: [&str; 5] = ["bps", "Kbps", "Mbps", "Gbps", "Tbps"];

fn scale(mut value: f64, step: f64, units: &[&str]) -> String {
    let mut idx = 0;
    while value.abs() >= step && idx + 1 < units.len() {
        value /= step;
        idx += 1;
    }
    format!("{value:.1} {}", units[idx])
}

/// Format a byte count in 1024 steps.
pub fn format_bytes(value: f64) -> String {
    scale(value, 1024.0, &BYTE_UNITS)
}

/// Format a bit rate in 1000 steps.
pub fn format_bps(value: f64) -> String {
    scale(value, 1000.0, &BIT_RATE_UNITS)
}

/// Format a percentage with one decimal.
pub fn format_pct(value: f64) -> String {
    format!("{value:.1}%")
}

/// Format a value for display according to its unit.
pub fn format_value(value: &MetricValue, unit: MetricUnit) -> String {
    let Some(v) = value.as_f64() else {
        return value.to_string();
    };
    match unit {
        MetricUnit::Bytes => format_bytes(v),
        MetricUnit::Bps => format_bps(v),
        MetricUnit::Percent => format_pct(v),
        MetricUnit::Milliseconds => format!("{v:.1} ms"),
        MetricUnit::Celsius => format!("{v:.1} °C"),
        MetricUnit::Dbm => format!("{v:.1} dBm"),
        _ => format!("{v}"),
    }
}
