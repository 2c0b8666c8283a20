//! Configuration module.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address, collector secret)
//! - Database settings (URL, batching, retention)
//! - Collector settings (identity, timeouts, backend)
//! - Device definitions, inline or from an include directory

mod app;
mod device;
mod validation;

pub use app::{
    AppConfig, BackendConfig, CollectorConfig, DatabaseConfig, HealthConfig, ServerConfig,
};
pub use device::{
    CollectionTier, DEFAULT_API_PORT, DEFAULT_API_SSL_PORT, DEFAULT_REST_PORT, DeviceConfig,
    DevicesConfig, InterfaceTier, TierIntervals, Transport,
};
pub use validation::{ConfigError, expand_env_vars, parse_duration};

// Re-export constants
pub use app::{DEFAULT_BATCH_SIZE, DEFAULT_CHANNEL_CAPACITY, DEFAULT_RECONCILE_INTERVAL};
