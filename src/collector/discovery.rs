//! Capability discovery, run after every (re)connect.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::protocol::{ProtocolError, RouterClient, Row};

const RESOURCE_KEYS: &[&str] = &[
    "version",
    "board-name",
    "architecture-name",
    "cpu-count",
    "total-memory",
    "total-hdd-space",
];

/// Package names mapped to the feature flags they enable.
const PACKAGE_FEATURES: &[(&str, &[&str])] = &[
    ("wireless", &["has_wireless"]),
    ("wifi-qcom", &["has_wireless"]),
    ("wifi-qcom-ac", &["has_wireless"]),
    ("wifiwave2", &["has_wireless"]),
    ("lte", &["has_lte"]),
    ("container", &["has_container"]),
    ("gps", &["has_gps"]),
    ("mpls", &["has_mpls"]),
    ("ipv6", &["has_ipv6"]),
    ("routing", &["has_bgp", "has_ospf"]),
    ("ppp", &["has_ppp"]),
    ("hotspot", &["has_hotspot"]),
    ("dhcp", &["has_dhcp_server"]),
];

/// Features bundled into the base system from RouterOS 7.
const BUILTIN_V7: &[&str] = &[
    "has_bgp",
    "has_ospf",
    "has_mpls",
    "has_ipv6",
    "has_ppp",
    "has_hotspot",
    "has_dhcp_server",
];

fn major_version(version: &str) -> Option<u32> {
    version.split(['.', ' ']).next()?.parse().ok()
}

async fn optional(
    client: &mut dyn RouterClient,
    path: &str,
    timeout: Duration,
) -> Result<Vec<Row>, ProtocolError> {
    match client.run_command(path, &[], timeout).await {
        Err(ProtocolError::Trap { .. }) => Ok(Vec::new()),
        other => other,
    }
}

/// Query resource, routerboard, identity and packages and build the
/// capability map pushed to the backend.
pub async fn discover(
    client: &mut dyn RouterClient,
    timeout: Duration,
) -> Result<Map<String, Value>, ProtocolError> {
    let mut caps = Map::new();

    let resource = optional(client, "/system/resource/print", timeout).await?;
    if let Some(row) = resource.first() {
        for key in RESOURCE_KEYS {
            if let Some(v) = row.get(*key) {
                caps.insert((*key).to_string(), Value::String(v.clone()));
            }
        }
    }

    let board = optional(client, "/system/routerboard/print", timeout).await?;
    if let Some(serial) = board.first().and_then(|r| r.get("serial-number")) {
        caps.insert("serial-number".into(), Value::String(serial.clone()));
    }

    let identity = optional(client, "/system/identity/print", timeout).await?;
    if let Some(name) = identity.first().and_then(|r| r.get("name")) {
        caps.insert("identity".into(), Value::String(name.clone()));
    }

    let major = caps
        .get("version")
        .and_then(Value::as_str)
        .and_then(major_version);
    caps.insert("supports_rest".into(), Value::Bool(major.is_some_and(|m| m >= 7)));

    let packages = optional(client, "/system/package/print", timeout).await?;
    let mut features = features_from_packages(&packages);
    if major.is_some_and(|m| m >= 7) {
        features.extend(BUILTIN_V7.iter().copied());
    }
    for feature in features {
        caps.insert(feature.to_string(), Value::Bool(true));
    }

    let wifi_mode = wifi_mode(&packages);
    if let Some(mode) = wifi_mode {
        caps.insert("wifi_mode".into(), Value::String(mode.to_string()));
    }

    Ok(caps)
}

fn enabled_packages(packages: &[Row]) -> impl Iterator<Item = &str> {
    packages
        .iter()
        .filter(|p| p.get("disabled").is_none_or(|d| d != "true"))
        .filter_map(|p| p.get("name").map(String::as_str))
}

fn features_from_packages(packages: &[Row]) -> Vec<&'static str> {
    let mut features = Vec::new();
    for name in enabled_packages(packages) {
        if let Some((_, flags)) = PACKAGE_FEATURES.iter().find(|(pkg, _)| *pkg == name) {
            features.extend(flags.iter().copied());
        }
    }
    features
}

fn wifi_mode(packages: &[Row]) -> Option<&'static str> {
    let names: Vec<&str> = enabled_packages(packages).collect();
    if names
        .iter()
        .any(|n| n.starts_with("wifi-qcom") || *n == "wifiwave2")
    {
        Some("wifi")
    } else if names.contains(&"wireless") {
        Some("wireless")
    } else {
        None
    }
}
