//! Dynamic interface selection for the T0 loop.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use crate::config::InterfaceTier;

/// Recent byte throughput per interface, fed by realtime counters.
#[derive(Debug, Default)]
pub struct TrafficTracker {
    last: HashMap<String, (f64, Instant)>,
    rates: HashMap<String, f64>,
}

impl TrafficTracker {
    /// Record a cumulative rx+tx byte counter for `name`.
    pub fn record(&mut self, name: &str, total_bytes: f64, at: Instant) {
        if let Some((prev, prev_at)) = self.last.get(name) {
            let elapsed = at.saturating_duration_since(*prev_at).as_secs_f64();
            if elapsed > 0.0 {
                // A counter reset restarts the baseline without a rate
                if total_bytes >= *prev {
                    self.rates
                        .insert(name.to_string(), (total_bytes - prev) / elapsed);
                }
            }
        }
        self.last.insert(name.to_string(), (total_bytes, at));
    }

    /// Bytes per second between the two latest samples, 0 when unknown.
    pub fn rate(&self, name: &str) -> f64 {
        self.rates.get(name).copied().unwrap_or(0.0)
    }

    /// Forget interfaces that no longer exist.
    pub fn retain(&mut self, names: &HashSet<&str>) {
        self.last.retain(|k, _| names.contains(k.as_str()));
        self.rates.retain(|k, _| names.contains(k.as_str()));
    }
}

/// Choose the interfaces polled at T0 cadence.
///
/// `pinned` (uplinks, then SLA interfaces) come first, followed by candidates
/// overridden to `t0`. Remaining capacity up to `max` is filled from the other
/// candidates by descending recent traffic, ties broken by name; candidates
/// overridden to `t1` or `t2` never enter the fill. The result never exceeds
/// `max`.
pub fn select_t0(
    pinned: &[String],
    candidates: &[String],
    overrides: &BTreeMap<String, InterfaceTier>,
    traffic: &TrafficTracker,
    max: usize,
) -> Vec<String> {
    let tier = |name: &str| overrides.get(name).copied().unwrap_or_default();
    let forced = candidates.iter().filter(|c| tier(c.as_str()) == InterfaceTier::T0);

    let mut selected: Vec<String> = Vec::with_capacity(max);
    for name in pinned.iter().chain(forced) {
        if selected.len() == max {
            return selected;
        }
        if !selected.contains(name) {
            selected.push(name.clone());
        }
    }

    let mut rest: Vec<&String> = candidates
        .iter()
        .filter(|c| !selected.contains(c) && tier(c.as_str()) == InterfaceTier::Auto)
        .collect();
    rest.sort_by(|a, b| {
        traffic
            .rate(b)
            .partial_cmp(&traffic.rate(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    rest.dedup();

    let room = max.saturating_sub(selected.len());
    selected.extend(rest.into_iter().take(room).cloned());
    selected
}
