//! Per-device connection state machine.
//!
//! ```text
//! disconnected -> connecting -> connected
//! connected -> degraded            (a poll failed)
//! connected | degraded -> down     (no success within the down window)
//! down -> connecting               (next scheduled attempt)
//! ```

use std::time::{Duration, Instant};

use strum_macros::{AsRefStr, Display};

use crate::storage::DOWN_AFTER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Down,
}

/// A transition worth reporting as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
}

#[derive(Debug)]
pub struct HealthTracker {
    state: ConnectionState,
    last_success: Option<Instant>,
    /// Start of the current unresponsive stretch.
    since: Instant,
    down_after: Duration,
    reported_up: bool,
}

impl HealthTracker {
    pub fn new(now: Instant) -> Self {
        Self::with_down_after(now, DOWN_AFTER)
    }

    pub fn with_down_after(now: Instant, down_after: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_success: None,
            since: now,
            down_after,
            reported_up: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// A connection attempt is starting.
    pub fn connecting(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Down
        ) {
            self.state = ConnectionState::Connecting;
        }
    }

    /// A connect or poll succeeded.
    pub fn success(&mut self, now: Instant) -> Option<Transition> {
        self.last_success = Some(now);
        self.state = ConnectionState::Connected;
        if self.reported_up {
            None
        } else {
            self.reported_up = true;
            Some(Transition::Up)
        }
    }

    /// A connect or poll failed. `dropped` means the connection was lost.
    pub fn failure(&mut self, now: Instant, dropped: bool) -> Option<Transition> {
        let reference = self.last_success.unwrap_or(self.since);
        if now.saturating_duration_since(reference) > self.down_after {
            if self.state == ConnectionState::Down {
                return None;
            }
            self.state = ConnectionState::Down;
            let was_up = std::mem::replace(&mut self.reported_up, false);
            return was_up.then_some(Transition::Down);
        }

        self.state = match self.state {
            ConnectionState::Connected | ConnectionState::Degraded => ConnectionState::Degraded,
            ConnectionState::Connecting if dropped => ConnectionState::Disconnected,
            other => other,
        };
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: Duration = Duration::from_secs(1);

    #[test]
    fn test_connect_then_degrade_then_down() {
        let t0 = Instant::now();
        let mut h = HealthTracker::new(t0);
        assert_eq!(h.state(), ConnectionState::Disconnected);

        h.connecting();
        assert_eq!(h.state(), ConnectionState::Connecting);
        assert_eq!(h.success(t0), Some(Transition::Up));
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.success(t0 + S), None);

        assert_eq!(h.failure(t0 + 10 * S, true), None);
        assert_eq!(h.state(), ConnectionState::Degraded);

        assert_eq!(h.failure(t0 + 150 * S, true), Some(Transition::Down));
        assert_eq!(h.state(), ConnectionState::Down);
        // Reported once
        assert_eq!(h.failure(t0 + 160 * S, true), None);

        h.connecting();
        assert_eq!(h.state(), ConnectionState::Connecting);
        assert_eq!(h.success(t0 + 170 * S), Some(Transition::Up));
    }

    #[test]
    fn test_never_connected_goes_down_silently() {
        let t0 = Instant::now();
        let mut h = HealthTracker::new(t0);
        h.connecting();
        assert_eq!(h.failure(t0 + S, true), None);
        assert_eq!(h.state(), ConnectionState::Disconnected);

        h.connecting();
        assert_eq!(h.failure(t0 + 200 * S, true), None);
        assert_eq!(h.state(), ConnectionState::Down);
    }

    #[test]
    fn test_degraded_recovers() {
        let t0 = Instant::now();
        let mut h = HealthTracker::with_down_after(t0, 30 * S);
        h.connecting();
        h.success(t0);
        h.failure(t0 + 5 * S, false);
        assert_eq!(h.state(), ConnectionState::Degraded);
        assert_eq!(h.success(t0 + 6 * S), None);
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.last_success(), Some(t0 + 6 * S));
    }
}
