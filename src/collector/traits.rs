//! Core collector types: errors, tiers and cadence helpers.

use std::time::Duration;

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::collector::BackendError;
use crate::config::{CollectionTier, DeviceConfig};
use crate::protocol::ProtocolError;

/// Lower bound of any per-call timeout.
pub const MIN_CALL_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors that can occur during collection and scheduling.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Router communication failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Delivery to the backend failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Invalid device or collector configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Timeout elapsed.
    #[error("timeout elapsed after {0:?}")]
    Timeout(Duration),

    /// Scheduler lifecycle error.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// A polling cadence class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Tier {
    /// Bounded interface subset, fastest cadence.
    T0,
    Realtime,
    Short,
    Medium,
    Long,
    Extended,
}

impl Tier {
    /// The five regular tiers, fastest first.
    pub const REGULAR: [Tier; 5] = [
        Tier::Realtime,
        Tier::Short,
        Tier::Medium,
        Tier::Long,
        Tier::Extended,
    ];

    /// Cadence of this tier for `device`, or None when the tier does not run.
    pub fn interval(self, device: &DeviceConfig) -> Option<Duration> {
        let i = &device.intervals;
        let secs = match self {
            Tier::T0 => return device.t0_active().then(|| device.t0_period()),
            Tier::Realtime => match device.collection_tier {
                CollectionTier::T2 => i.short.max(i.realtime),
                CollectionTier::T0 | CollectionTier::T1 => i.realtime,
            },
            Tier::Short => i.short,
            Tier::Medium => i.medium,
            Tier::Long => i.long,
            Tier::Extended => i.extended,
        };
        Some(Duration::from_secs(secs))
    }

    /// Whether a poll at this tier may (re)establish the connection.
    pub fn may_connect(self) -> bool {
        self != Tier::T0
    }

    /// Tiers that run for `device`, with their cadence.
    pub fn schedule(device: &DeviceConfig) -> Vec<(Tier, Duration)> {
        std::iter::once(Tier::T0)
            .chain(Tier::REGULAR)
            .filter_map(|t| t.interval(device).map(|d| (t, d)))
            .collect()
    }
}

/// Per-call timeout: `min(command_timeout, interval / 2)`, floored at [`MIN_CALL_TIMEOUT`].
pub fn call_timeout(command_timeout: Duration, interval: Duration) -> Duration {
    command_timeout.min(interval / 2).max(MIN_CALL_TIMEOUT)
}

/// Time limits of one tier cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLimits {
    /// Bound of each router call, and of the wait for the device's connection.
    pub call: Duration,
    /// Bound of the whole cycle, connect and discovery included.
    pub cycle: Duration,
}

impl PollLimits {
    /// Limits for a tier running every `interval`: a cycle ends within three
    /// quarters of the interval so it never runs into the next tick.
    pub fn for_interval(command_timeout: Duration, interval: Duration) -> Self {
        let call = call_timeout(command_timeout, interval);
        Self {
            call,
            cycle: (interval * 3 / 4).max(call),
        }
    }
}
