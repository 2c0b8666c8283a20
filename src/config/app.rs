//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::device::{DeviceConfig, DevicesConfig};
use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default channel capacity of the storage writer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Default number of buffered points before a flush.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default reconcile interval of the collector scheduler.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Bounds applied to the reconcile interval.
pub const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    "sqlite:data/routerwatch.db?mode=rwc".to_string()
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_points_retention_days() -> u32 {
    90
}

fn default_events_retention_days() -> u32 {
    180
}

fn default_collector_id() -> String {
    "collector-01".to_string()
}

fn default_reconcile_interval() -> Duration {
    DEFAULT_RECONCILE_INTERVAL
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

// =============================================================================
// Server Configuration
// =============================================================================

/// HTTP ingest server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Run the backend role (storage, sink, HTTP API).
    pub enabled: bool,

    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,

    /// Shared HMAC secret for collectors. Unset means unauthenticated
    /// development mode.
    pub collector_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8080,
            collector_secret: None,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// MPSC channel capacity for write operations (default: 10000).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Points buffered before a flush (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time points stay buffered (default: 1s).
    #[serde(default = "default_batch_flush_interval", with = "humantime_serde")]
    pub batch_flush_interval: Duration,

    #[serde(default = "default_points_retention_days")]
    pub points_retention_days: u32,

    #[serde(default = "default_events_retention_days")]
    pub events_retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_flush_interval: default_batch_flush_interval(),
            points_retention_days: default_points_retention_days(),
            events_retention_days: default_events_retention_days(),
        }
    }
}

// =============================================================================
// Collector Configuration
// =============================================================================

/// Where the collector sends its data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of a remote backend. Unset means in-process.
    #[serde(default)]
    pub url: Option<String>,

    /// HMAC secret shared with the remote backend.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Collector role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_collector_id")]
    pub collector_id: String,

    /// How often the device list is reconciled (default: 2s, clamped to 1-5s).
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,

    #[serde(default = "default_watchdog_interval", with = "humantime_serde")]
    pub watchdog_interval: Duration,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    /// Grace period for tier tasks to exit on stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collector_id: default_collector_id(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            watchdog_interval: default_watchdog_interval(),
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            backend: BackendConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Reconcile interval clamped to the supported range.
    pub fn effective_reconcile_interval(&self) -> Duration {
        self.reconcile_interval
            .clamp(MIN_RECONCILE_INTERVAL, MAX_RECONCILE_INTERVAL)
    }
}

// =============================================================================
// Health Configuration
// =============================================================================

/// Device health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Devices defined inline.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Path to a directory with additional device files.
    #[serde(default)]
    pub devices_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file, including `devices_path`.
    ///
    /// # Errors
    /// Returns `ConfigError` if a file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_yaml(&content)?;

        if let Some(ref dir) = config.devices_path {
            let extra = DevicesConfig::load_from_dir(dir)?;
            config.devices.extend(extra.devices);
        }

        config.expand_secrets();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without touching the filesystem.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Expand `${VAR}` references in secret fields.
    pub fn expand_secrets(&mut self) {
        if let Some(secret) = self.server.collector_secret.as_mut() {
            *secret = expand_env_vars(secret);
        }
        if let Some(secret) = self.collector.backend.secret.as_mut() {
            *secret = expand_env_vars(secret);
        }
        for device in &mut self.devices {
            device.password = expand_env_vars(&device.password);
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        if self.server.port == 0 {
            return Err(ConfigError::Invalid(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.database.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "database channel_capacity must be positive".to_string(),
            ));
        }

        if self.database.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "database batch_size must be positive".to_string(),
            ));
        }

        if self.collector.collector_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "collector_id cannot be empty".to_string(),
            ));
        }

        if self.collector.command_timeout.is_zero() || self.collector.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "collector timeouts must be positive".to_string(),
            ));
        }

        if let Some(ref url) = self.collector.backend.url {
            url::Url::parse(url).map_err(|e| {
                ConfigError::Invalid(format!("invalid backend url '{}': {}", url, e))
            })?;
        }

        if !self.server.enabled && self.collector.enabled && self.collector.backend.url.is_none() {
            return Err(ConfigError::Invalid(
                "collector without a local backend needs collector.backend.url".to_string(),
            ));
        }

        DevicesConfig {
            devices: self.devices.clone(),
        }
        .validate()?;

        Ok(())
    }
}
