//! Counter-to-rate conversion.

use chrono::{DateTime, Utc};

/// Result of deriving a rate from a counter sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateOutcome {
    /// Per-second rate since the previous sample.
    Rate(f64),
    /// The counter went backwards (reset or wrap); no rate for this sample.
    CounterReset,
    /// No previous sample to compare against.
    NoBaseline,
    /// The sample is not newer than the previous one.
    NonIncreasingTime,
}

impl RateOutcome {
    pub fn rate(&self) -> Option<f64> {
        match self {
            Self::Rate(r) => Some(*r),
            _ => None,
        }
    }
}

/// Compute `(value - prev) / (ts - prev_ts)` in units per second.
///
/// A value below the previous one is treated as a counter reset and
/// suppressed rather than reported as a negative rate.
pub fn counter_rate(
    previous: Option<(f64, DateTime<Utc>)>,
    value: f64,
    ts: DateTime<Utc>,
) -> RateOutcome {
    let Some((prev_value, prev_ts)) = previous else {
        return RateOutcome::NoBaseline;
    };
    let elapsed_ms = (ts - prev_ts).num_milliseconds();
    if elapsed_ms <= 0 {
        return RateOutcome::NonIncreasingTime;
    }
    if value < prev_value {
        return RateOutcome::CounterReset;
    }
    RateOutcome::Rate((value - prev_value) / (elapsed_ms as f64 / 1000.0))
}
