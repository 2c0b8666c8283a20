//! RouterOS commands per tier and their normalization into wire metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::collector::Tier;
use crate::config::DeviceConfig;
use crate::ingest::EventRecord;
use crate::metric::parse::parse_uptime;
use crate::metric::{MetricMap, interface_key};
use crate::protocol::{ProtocolError, RouterClient, Row};
use crate::storage::RawRecord;

/// Inputs of one tier poll beyond the client itself.
#[derive(Debug, Clone, Copy)]
pub struct PollContext<'a> {
    pub device: &'a DeviceConfig,
    pub timeout: Duration,
    pub now: DateTime<Utc>,
    /// Interfaces currently selected for T0.
    pub t0_selection: &'a [String],
    /// Highest log entry id already reported.
    pub log_watermark: Option<u64>,
}

/// Everything a tier poll produced.
#[derive(Debug, Default)]
pub struct TierOutput {
    pub metrics: MetricMap,
    /// Interface inventory (medium tier).
    pub interfaces: Option<Vec<RawRecord>>,
    pub leases: Option<Vec<RawRecord>>,
    /// `(session_type, rows)` per session source that answered.
    pub sessions: Vec<(&'static str, Vec<RawRecord>)>,
    pub events: Vec<EventRecord>,
    /// Cumulative rx+tx bytes per interface, for T0 ranking.
    pub traffic: Vec<(String, f64)>,
    pub log_watermark: Option<u64>,
    /// Commands that failed on the router and were skipped.
    pub skipped: usize,
}

impl TierOutput {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
            && self.interfaces.is_none()
            && self.leases.is_none()
            && self.sessions.is_empty()
            && self.events.is_empty()
    }
}

/// Convert reply rows into the loosely-typed records used by inventory syncs.
pub fn to_raw(rows: Vec<Row>) -> Vec<RawRecord> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect()
        })
        .collect()
}

fn number(row: &Row, key: &str) -> Option<f64> {
    row.get(key)?.trim().parse().ok()
}

fn is_true(row: &Row, key: &str) -> bool {
    row.get(key).is_some_and(|v| v == "true" || v == "yes")
}

/// Parse a RouterOS sub-second duration (`12ms`, `1ms450us`, `350us`) into milliseconds.
pub fn parse_millis(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }
    let mut total = 0.0;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    let mut matched = false;
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
            continue;
        }
        let value: f64 = digits.parse().unwrap_or(0.0);
        digits.clear();
        let millis = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                value
            }
            'u' if chars.peek() == Some(&'s') => {
                chars.next();
                value / 1000.0
            }
            's' => value * 1000.0,
            'm' => value * 60_000.0,
            'h' => value * 3_600_000.0,
            _ => continue,
        };
        matched = true;
        total += millis;
    }
    matched.then_some(total)
}

/// Run one command; a router-side failure (`!trap`) only skips its data.
async fn query(
    client: &mut dyn RouterClient,
    path: &str,
    params: &[(&str, &str)],
    ctx: &PollContext<'_>,
    out: &mut TierOutput,
) -> Result<Option<Vec<Row>>, ProtocolError> {
    match client.run_command(path, params, ctx.timeout).await {
        Ok(rows) => Ok(Some(rows)),
        Err(ProtocolError::Trap { message, .. }) => {
            tracing::debug!(
                device = %ctx.device.device_uid,
                command = path,
                error = %message,
                "Command failed on router, skipping"
            );
            out.skipped += 1;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Poll one tier.
///
/// Transport errors abort the poll and are returned; the caller drops the
/// connection state accordingly.
pub async fn poll(
    tier: Tier,
    client: &mut dyn RouterClient,
    ctx: &PollContext<'_>,
) -> Result<TierOutput, ProtocolError> {
    let mut out = TierOutput {
        log_watermark: ctx.log_watermark,
        ..Default::default()
    };
    match tier {
        Tier::T0 => poll_t0(client, ctx, &mut out).await?,
        Tier::Realtime => poll_realtime(client, ctx, &mut out).await?,
        Tier::Short => poll_short(client, ctx, &mut out).await?,
        Tier::Medium => poll_medium(client, ctx, &mut out).await?,
        Tier::Long => poll_long(client, ctx, &mut out).await?,
        Tier::Extended => poll_extended(client, ctx, &mut out).await?,
    }
    Ok(out)
}

async fn poll_t0(
    client: &mut dyn RouterClient,
    ctx: &PollContext<'_>,
    out: &mut TierOutput,
) -> Result<(), ProtocolError> {
    if ctx.t0_selection.is_empty() {
        return Ok(());
    }
    let names = ctx.t0_selection.join(",");
    let params = [("interface", names.as_str()), ("once", "")];
    if let Some(rows) = query(client, "/interface/monitor-traffic", &params, ctx, out).await? {
        for row in &rows {
            let Some(name) = row.get("name") else {
                continue;
            };
            for (field, attr) in [
                ("rx_bps", "rx-bits-per-second"),
                ("tx_bps", "tx-bits-per-second"),
                ("rx_pps", "rx-packets-per-second"),
                ("tx_pps", "tx-packets-per-second"),
            ] {
                if let Some(v) = number(row, attr) {
                    out.metrics.insert(interface_key(name, field), v.into());
                }
            }
        }
    }
    Ok(())
}

fn resource_metrics(row: &Row, metrics: &mut MetricMap) {
    if let Some(cpu) = number(row, "cpu-load") {
        metrics.insert("system.cpu.load_pct".into(), cpu.into());
    }
    if let (Some(total), Some(free)) = (number(row, "total-memory"), number(row, "free-memory")) {
        let used = (total - free).max(0.0);
        metrics.insert("system.mem.used_bytes".into(), used.into());
        metrics.insert("system.mem.free_bytes".into(), free.into());
        if total > 0.0 {
            metrics.insert("system.memory.used_pct".into(), (used / total * 100.0).into());
        }
    }
    if let Some(disk) = number(row, "free-hdd-space") {
        metrics.insert("system.disk.free_bytes".into(), disk.into());
    }
    if let Some(uptime) = row.get("uptime") {
        metrics.insert("system.uptime_sec".into(), parse_uptime(uptime).into());
    }
    if let Some(version) = row.get("version") {
        metrics.insert("system.version".into(), version.as_str().into());
    }
}

/// RouterOS 6 reports `temperature=`; 7 reports one row per sensor.
fn temperature(rows: &[Row]) -> Option<f64> {
    rows.iter()
        .find_map(|r| number(r, "temperature"))
        .or_else(|| {
            ["temperature", "cpu-temperature", "board-temperature1"]
                .iter()
                .find_map(|sensor| {
                    rows.iter()
                        .find(|r| r.get("name").is_some_and(|n| n == sensor))
                        .and_then(|r| number(r, "value"))
                })
        })
}

fn ping_metrics(rows: &[Row], metrics: &mut MetricMap) {
    let Some(last) = rows.last() else {
        return;
    };
    let sent = number(last, "sent").unwrap_or(1.0);
    let received = number(last, "received").unwrap_or(0.0);
    let loss = number(last, "packet-loss").unwrap_or_else(|| {
        if sent > 0.0 {
            (sent - received) / sent * 100.0
        } else {
            100.0
        }
    });
    metrics.insert("ping.loss_pct".into(), loss.into());

    let rtt = ["avg-rtt", "time"]
        .iter()
        .find_map(|k| last.get(*k).and_then(|v| parse_millis(v)));
    if let Some(rtt) = rtt
        && received > 0.0
    {
        metrics.insert("ping.rtt_ms".into(), rtt.into());
    }
}

fn interface_counters(rows: &[Row], out: &mut TierOutput) {
    for row in rows {
        let Some(name) = row.get("name") else {
            continue;
        };
        for (field, attr) in [
            ("rx_bytes_total", "rx-byte"),
            ("tx_bytes_total", "tx-byte"),
            ("rx_packets_total", "rx-packet"),
            ("tx_packets_total", "tx-packet"),
            ("rx_errors", "rx-error"),
            ("tx_errors", "tx-error"),
        ] {
            if let Some(v) = number(row, attr) {
                out.metrics.insert(interface_key(name, field), v.into());
            }
        }
        if let (Some(rx), Some(tx)) = (number(row, "rx-byte"), number(row, "tx-byte")) {
            out.traffic.push((name.clone(), rx + tx));
        }
    }
}

async fn poll_realtime(
    client: &mut dyn RouterClient,
    ctx: &PollContext<'_>,
    out: &mut TierOutput,
) -> Result<(), ProtocolError> {
    if let Some(rows) = query(client, "/system/resource/print", &[], ctx, out).await?
        && let Some(row) = rows.first()
    {
        resource_metrics(row, &mut out.metrics);
    }

    if let Some(rows) = query(client, "/system/health/print", &[], ctx, out).await?
        && let Some(temp) = temperature(&rows)
    {
        out.metrics.insert("system.temperature".into(), temp.into());
    }

    let target = ctx.device.ping_target.as_str();
    let params = [("address", target), ("count", "1")];
    if let Some(rows) = query(client, "/ping", &params, ctx, out).await? {
        ping_metrics(&rows, &mut out.metrics);
    }

    if let Some(rows) = query(client, "/interface/print", &[("stats", "")], ctx, out).await? {
        interface_counters(&rows, out);
    }
    Ok(())
}

async fn poll_short(
    client: &mut dyn RouterClient,
    ctx: &PollContext<'_>,
    out: &mut TierOutput,
) -> Result<(), ProtocolError> {
    if let Some(rows) = query(client, "/ip/dhcp-server/lease/print", &[], ctx, out).await? {
        out.leases = Some(to_raw(rows));
    }
    if let Some(rows) = query(client, "/ppp/active/print", &[], ctx, out).await? {
        out.sessions.push(("pppoe", to_raw(rows)));
    }
    if let Some(rows) = query(client, "/ip/hotspot/active/print", &[], ctx, out).await? {
        out.sessions.push(("hotspot", to_raw(rows)));
    }
    if let Some(rows) =
        query(client, "/ip/firewall/connection/tracking/print", &[], ctx, out).await?
        && let Some(count) = rows
            .first()
            .and_then(|r| number(r, "total-entries").or_else(|| number(r, "total")))
    {
        out.metrics
            .insert("firewall.conntrack_count".into(), count.into());
    }
    Ok(())
}

async fn poll_medium(
    client: &mut dyn RouterClient,
    ctx: &PollContext<'_>,
    out: &mut TierOutput,
) -> Result<(), ProtocolError> {
    if let Some(rows) = query(client, "/interface/print", &[], ctx, out).await? {
        out.interfaces = Some(to_raw(rows));
    }
    if let Some(rows) = query(client, "/queue/simple/print", &[], ctx, out).await? {
        out.metrics
            .insert("queue.simple_count".into(), rows.len().into());
    }
    Ok(())
}

async fn poll_long(
    client: &mut dyn RouterClient,
    ctx: &PollContext<'_>,
    out: &mut TierOutput,
) -> Result<(), ProtocolError> {
    if let Some(rows) = query(client, "/ip/arp/print", &[], ctx, out).await? {
        out.metrics.insert("arp.entry_count".into(), rows.len().into());
    }
    if let Some(rows) = query(client, "/ip/route/print", &[], ctx, out).await? {
        let active = rows.iter().filter(|r| is_true(r, "active")).count();
        out.metrics
            .insert("routing.route_count".into(), rows.len().into());
        out.metrics
            .insert("routing.active_route_count".into(), active.into());
    }
    if let Some(rows) = query(client, "/ip/firewall/filter/print", &[], ctx, out).await? {
        out.metrics
            .insert("firewall.filter_rule_count".into(), rows.len().into());
    }
    if let Some(rows) = query(client, "/ip/firewall/nat/print", &[], ctx, out).await? {
        out.metrics
            .insert("firewall.nat_rule_count".into(), rows.len().into());
    }
    Ok(())
}

fn log_id(row: &Row) -> Option<u64> {
    let id = row.get(".id")?;
    u64::from_str_radix(id.trim_start_matches('*'), 16).ok()
}

/// Map a log entry to an event.
pub fn log_event(device_uid: &str, row: &Row, now: DateTime<Utc>) -> EventRecord {
    let topics = row.get("topics").map(String::as_str).unwrap_or_default();
    let message = row.get("message").cloned().unwrap_or_default();
    let has = |t: &str| topics.split(',').any(|x| x.trim() == t);

    let severity = if has("critical") {
        "critical"
    } else if has("error") {
        "error"
    } else if has("warning") {
        "warning"
    } else {
        "info"
    };
    let event_type = if has("account") && message.to_lowercase().contains("login failure") {
        "login_failure"
    } else {
        match severity {
            "critical" | "error" => "error",
            "warning" => "warning",
            _ => "info",
        }
    };

    EventRecord {
        device_uid: device_uid.to_string(),
        ts: Some(now),
        event_type: event_type.to_string(),
        severity: if event_type == "login_failure" && severity == "info" {
            "warning".to_string()
        } else {
            severity.to_string()
        },
        subject: Some(topics.to_string()),
        message: Some(message),
        data: Some(serde_json::json!({
            "id": row.get(".id"),
            "time": row.get("time"),
        })),
    }
}

/// Entries newer than `watermark`, and the new watermark.
///
/// The first poll only establishes the watermark. Ids restarting below the
/// watermark mean the log was cleared (reboot) and everything is new.
pub fn new_log_entries(rows: &[Row], watermark: Option<u64>) -> (Vec<&Row>, Option<u64>) {
    let max = rows.iter().filter_map(log_id).max();
    let Some(mark) = watermark else {
        return (Vec::new(), max);
    };
    let Some(top) = max else {
        return (Vec::new(), Some(mark));
    };
    let floor = if top < mark { None } else { Some(mark) };
    let fresh = rows
        .iter()
        .filter(|r| match (log_id(r), floor) {
            (Some(id), Some(f)) => id > f,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .collect();
    (fresh, Some(top))
}

async fn poll_extended(
    client: &mut dyn RouterClient,
    ctx: &PollContext<'_>,
    out: &mut TierOutput,
) -> Result<(), ProtocolError> {
    if let Some(rows) = query(client, "/routing/bgp/session/print", &[], ctx, out).await? {
        let established = rows.iter().filter(|r| is_true(r, "established")).count();
        out.metrics.insert("bgp.peer_count".into(), rows.len().into());
        out.metrics
            .insert("bgp.established_count".into(), established.into());
    }
    if let Some(rows) = query(client, "/routing/ospf/neighbor/print", &[], ctx, out).await? {
        let full = rows
            .iter()
            .filter(|r| {
                r.get("state")
                    .is_some_and(|s| s.eq_ignore_ascii_case("full"))
            })
            .count();
        out.metrics
            .insert("ospf.neighbor_count".into(), rows.len().into());
        out.metrics.insert("ospf.full_count".into(), full.into());
    }
    if let Some(rows) = query(client, "/user/print", &[], ctx, out).await? {
        out.metrics
            .insert("system.user_count".into(), rows.len().into());
    }
    if let Some(rows) = query(client, "/log/print", &[], ctx, out).await? {
        let (fresh, mark) = new_log_entries(&rows, ctx.log_watermark);
        out.events = fresh
            .into_iter()
            .map(|r| log_event(&ctx.device.device_uid, r, ctx.now))
            .collect();
        out.log_watermark = mark;
    }
    Ok(())
}
