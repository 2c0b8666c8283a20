//! Device configuration structures.
//!
//! A [`DeviceConfig`] carries everything a collector needs to poll one
//! router: connection parameters, tier cadences and T0 settings. The same
//! structure is used in YAML files, in the device store and on the wire
//! (`POST /devices`).

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use super::validation::ConfigError;

/// Binary API port.
pub const DEFAULT_API_PORT: u16 = 8728;

/// Binary API over TLS port.
pub const DEFAULT_API_SSL_PORT: u16 = 8729;

/// REST API (HTTPS) port.
pub const DEFAULT_REST_PORT: u16 = 443;

fn default_username() -> String {
    "admin".to_string()
}

fn default_ping_target() -> String {
    "8.8.8.8".to_string()
}

fn default_true() -> bool {
    true
}

fn default_t0_interval() -> u64 {
    1
}

fn default_t0_max_interfaces() -> usize {
    10
}

/// Coarse collection class of a device.
///
/// - `t0`: the five tiers plus the fast T0 interface loop
/// - `t1`: the five tiers
/// - `t2`: the five tiers, realtime relaxed to the short cadence
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
pub enum CollectionTier {
    T0,
    #[default]
    T1,
    T2,
}

/// Per-interface override of the automatic T0 selection.
///
/// `t0` pins the interface into the T0 set (within the cap); `t1` and `t2`
/// keep it out of the traffic-ranked fill.
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
pub enum InterfaceTier {
    #[default]
    Auto,
    T0,
    T1,
    T2,
}

/// Management transport to use for a device.
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
pub enum Transport {
    /// Binary management API (8728/8729).
    #[default]
    Api,
    /// HTTPS REST API.
    Rest,
    /// REST when the device reports support for it, otherwise the binary API.
    Auto,
}

/// Poll intervals for the five tiers, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierIntervals {
    pub realtime: u64,
    pub short: u64,
    pub medium: u64,
    pub long: u64,
    pub extended: u64,
}

impl TierIntervals {
    /// Lowest allowed value for each tier.
    pub const FLOORS: TierIntervals = TierIntervals {
        realtime: 5,
        short: 30,
        medium: 120,
        long: 600,
        extended: 3600,
    };

    fn named(&self) -> [(&'static str, u64, u64); 5] {
        let f = Self::FLOORS;
        [
            ("realtime", self.realtime, f.realtime),
            ("short", self.short, f.short),
            ("medium", self.medium, f.medium),
            ("long", self.long, f.long),
            ("extended", self.extended, f.extended),
        ]
    }

    /// Check every interval against its floor.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value, floor) in self.named() {
            if value < floor {
                return Err(format!(
                    "{name} interval {value}s is below the minimum of {floor}s"
                ));
            }
        }
        Ok(())
    }
}

impl Default for TierIntervals {
    fn default() -> Self {
        Self {
            realtime: 5,
            short: 60,
            medium: 300,
            long: 3600,
            extended: 86400,
        }
    }
}

/// Configuration of one monitored device.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Globally unique device identifier.
    pub device_uid: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Management address (IP or hostname).
    pub host: String,

    /// Management port; defaults depend on transport and TLS.
    #[serde(default)]
    pub port: Option<u16>,

    /// Use TLS (api-ssl on 8729 for the binary API).
    #[serde(default)]
    pub use_ssl: bool,

    /// Verify the device certificate. RouterOS ships self-signed certificates,
    /// so this is off unless a proper certificate is installed.
    #[serde(default)]
    pub tls_verify: bool,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub transport: Transport,

    /// REST support as reported by capability discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_rest: Option<bool>,

    /// Ping target for realtime latency.
    #[serde(default = "default_ping_target")]
    pub ping_target: String,

    #[serde(default)]
    pub collection_tier: CollectionTier,

    #[serde(default = "default_true")]
    pub collection_enabled: bool,

    #[serde(default)]
    pub intervals: TierIntervals,

    /// T0 interval in seconds.
    #[serde(default = "default_t0_interval")]
    pub t0_interval: u64,

    /// Upper bound of interfaces polled at T0 cadence.
    #[serde(default = "default_t0_max_interfaces")]
    pub t0_max_interfaces: usize,

    /// Interfaces always polled at T0 cadence.
    #[serde(default)]
    pub uplink_interfaces: Vec<String>,

    /// SLA-monitored interfaces, always polled at T0 cadence.
    #[serde(default)]
    pub sla_interfaces: Vec<String>,

    /// Tier overrides by interface name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub interface_tiers: BTreeMap<String, InterfaceTier>,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("device_uid", &self.device_uid)
            .field("host", &self.host)
            .field("port", &self.effective_port())
            .field("transport", &self.transport)
            .field("collection_tier", &self.collection_tier)
            .field("collection_enabled", &self.collection_enabled)
            .finish_non_exhaustive()
    }
}

impl DeviceConfig {
    /// Create a device with default settings.
    pub fn new(device_uid: impl Into<String>, host: impl Into<String>) -> Self {
        let device_uid = device_uid.into();
        Self {
            name: device_uid.clone(),
            device_uid,
            host: host.into(),
            port: None,
            use_ssl: false,
            tls_verify: false,
            username: default_username(),
            password: String::new(),
            transport: Transport::default(),
            supports_rest: None,
            ping_target: default_ping_target(),
            collection_tier: CollectionTier::default(),
            collection_enabled: true,
            intervals: TierIntervals::default(),
            t0_interval: default_t0_interval(),
            t0_max_interfaces: default_t0_max_interfaces(),
            uplink_interfaces: Vec::new(),
            sla_interfaces: Vec::new(),
            interface_tiers: BTreeMap::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_tier(mut self, tier: CollectionTier) -> Self {
        self.collection_tier = tier;
        self
    }

    pub fn with_intervals(mut self, intervals: TierIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn with_uplinks(mut self, names: &[&str]) -> Self {
        self.uplink_interfaces = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_sla(mut self, names: &[&str]) -> Self {
        self.sla_interfaces = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_interface_tier(mut self, name: &str, tier: InterfaceTier) -> Self {
        self.interface_tiers.insert(name.to_string(), tier);
        self
    }

    /// Override for `name`, `auto` when none is configured.
    pub fn interface_tier(&self, name: &str) -> InterfaceTier {
        self.interface_tiers.get(name).copied().unwrap_or_default()
    }

    pub fn disabled(mut self) -> Self {
        self.collection_enabled = false;
        self
    }

    /// Whether the REST client should be used.
    pub fn use_rest(&self) -> bool {
        match self.transport {
            Transport::Api => false,
            Transport::Rest => true,
            Transport::Auto => self.supports_rest.unwrap_or(false),
        }
    }

    /// Port after applying transport/TLS defaults.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.use_rest() {
            DEFAULT_REST_PORT
        } else if self.use_ssl {
            DEFAULT_API_SSL_PORT
        } else {
            DEFAULT_API_PORT
        })
    }

    /// T0 cadence.
    pub fn t0_period(&self) -> Duration {
        Duration::from_secs(self.t0_interval)
    }

    /// Whether the fast T0 loop runs for this device.
    pub fn t0_active(&self) -> bool {
        self.collection_tier == CollectionTier::T0
    }

    /// Whether `other` differs in a way that requires rebuilding the collector.
    ///
    /// Discovered REST support only matters when the transport is `auto`.
    pub fn requires_rebuild(&self, other: &DeviceConfig) -> bool {
        if self.transport == Transport::Auto || other.transport == Transport::Auto {
            return self != other;
        }
        let mut a = self.clone();
        let mut b = other.clone();
        a.supports_rest = None;
        b.supports_rest = None;
        a != b
    }

    /// Validate connection parameters and cadences.
    pub fn validate(&self) -> Result<(), String> {
        if self.device_uid.trim().is_empty() {
            return Err("device_uid cannot be empty".to_string());
        }
        if self.host.trim().is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if self.username.trim().is_empty() {
            return Err("username cannot be empty".to_string());
        }
        if self.port == Some(0) {
            return Err("port must be non-zero".to_string());
        }
        self.intervals.validate()?;
        if self.t0_interval == 0 {
            return Err("t0_interval must be at least 1s".to_string());
        }
        if self.t0_max_interfaces == 0 {
            return Err("t0_max_interfaces must be positive".to_string());
        }
        if self.ping_target.trim().is_empty() {
            return Err("ping_target cannot be empty".to_string());
        }
        Ok(())
    }
}

/// A list of device definitions, as found in the main config or an include file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl DevicesConfig {
    /// Merge another DevicesConfig into this one.
    #[must_use]
    pub fn merge(mut self, other: DevicesConfig) -> Self {
        self.devices.extend(other.devices);
        self
    }

    /// Validate all device definitions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.device_uid.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device_uid: '{}'",
                    device.device_uid
                )));
            }
            device.validate().map_err(|reason| ConfigError::Device {
                uid: device.device_uid.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Load device definitions from all YAML files in a directory.
    pub fn load_from_dir(dir_path: &str) -> Result<Self, ConfigError> {
        let dir = Path::new(dir_path);
        if !dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "device_path '{}' is not a directory",
                dir_path
            )));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if path.is_file() && (ext == "yaml" || ext == "yml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut merged = Self::default();
        for path in paths {
            tracing::debug!("Loading devices from: {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            let file_config: Self = serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::Invalid(format!("failed to parse '{}': {}", path.display(), e))
            })?;
            merged = merged.merge(file_config);
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_defaults_from_yaml() {
        let device: DeviceConfig =
            serde_yaml::from_str("device_uid: MT-0001\nhost: 10.0.0.1\n").unwrap();
        assert_eq!(device.username, "admin");
        assert_eq!(device.ping_target, "8.8.8.8");
        assert_eq!(device.collection_tier, CollectionTier::T1);
        assert!(device.collection_enabled);
        assert_eq!(device.intervals, TierIntervals::default());
        assert_eq!(device.t0_interval, 1);
        assert_eq!(device.t0_max_interfaces, 10);
        assert_eq!(device.effective_port(), 8728);
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_interface_tier_overrides_from_yaml() {
        let yaml = "device_uid: MT-0001\nhost: 10.0.0.1\ninterface_tiers:\n  ether5: t0\n  wlan1: t2\n";
        let device: DeviceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(device.interface_tier("ether5"), InterfaceTier::T0);
        assert_eq!(device.interface_tier("wlan1"), InterfaceTier::T2);
        assert_eq!(device.interface_tier("ether1"), InterfaceTier::Auto);
        assert_eq!("T1".parse::<InterfaceTier>().unwrap(), InterfaceTier::T1);

        // Overrides change the T0 selection, so they force a rebuild
        let plain = DeviceConfig::new("a", "h");
        let pinned = plain.clone().with_interface_tier("ether5", InterfaceTier::T0);
        assert!(plain.requires_rebuild(&pinned));
    }

    #[test]
    fn test_effective_port() {
        let mut device = DeviceConfig::new("a", "h");
        device.use_ssl = true;
        assert_eq!(device.effective_port(), 8729);
        device.transport = Transport::Rest;
        assert_eq!(device.effective_port(), 443);
        device.port = Some(8443);
        assert_eq!(device.effective_port(), 8443);
    }

    #[test]
    fn test_interval_floors() {
        let mut device = DeviceConfig::new("a", "h");
        device.intervals.realtime = 4;
        let err = device.validate().unwrap_err();
        assert!(err.contains("realtime"));

        device.intervals.realtime = 5;
        device.intervals.medium = 119;
        assert!(device.validate().unwrap_err().contains("medium"));

        device.intervals.medium = 120;
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        assert!(DeviceConfig::new("", "h").validate().is_err());
        assert!(DeviceConfig::new("a", " ").validate().is_err());
        let mut d = DeviceConfig::new("a", "h");
        d.t0_max_interfaces = 0;
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_auto_transport_follows_capabilities() {
        let mut device = DeviceConfig::new("a", "h");
        device.transport = Transport::Auto;
        assert!(!device.use_rest());
        device.supports_rest = Some(true);
        assert!(device.use_rest());
    }

    #[test]
    fn test_requires_rebuild() {
        let base = DeviceConfig::new("a", "h");
        let mut discovered = base.clone();
        discovered.supports_rest = Some(true);
        assert!(!base.requires_rebuild(&discovered));

        let mut auto = base.clone();
        auto.transport = Transport::Auto;
        let mut auto_discovered = auto.clone();
        auto_discovered.supports_rest = Some(true);
        assert!(auto.requires_rebuild(&auto_discovered));

        let mut faster = base.clone();
        faster.intervals.short = 30;
        assert!(base.requires_rebuild(&faster));
    }

    #[test]
    fn test_debug_redacts_password() {
        let device = DeviceConfig::new("a", "h").with_credentials("admin", "hunter2");
        assert!(!format!("{device:?}").contains("hunter2"));
    }

    #[test]
    fn test_devices_config_duplicate_uid() {
        let config = DevicesConfig {
            devices: vec![DeviceConfig::new("a", "h1"), DeviceConfig::new("a", "h2")],
        };
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("edge.yaml"),
            "devices:\n  - device_uid: EDGE-1\n    host: 10.0.0.1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("core.yml"),
            "devices:\n  - device_uid: CORE-1\n    host: 10.0.0.2\n    collection_tier: t0\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let config = DevicesConfig::load_from_dir(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].device_uid, "CORE-1");
        assert!(config.devices[0].t0_active());
        assert!(config.validate().is_ok());
    }
}
