//! Application configuration loading from config.toml
//!
//! The file has three parts: `[engine]` tunables for the inventory and discovery
//! engine, `[server]` settings for the HTTP front end, and an optional list of
//! `[[businesses]]` used to seed the database on first run. Every field has a
//! default, so an empty or missing file yields a working configuration.

use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Inventory and discovery tunables
    pub engine: EngineConfig,
    /// HTTP server settings
    pub server: ServerConfig,
    /// Businesses to create if they do not exist yet
    pub businesses: Vec<BusinessSeed>,
}

/// Tunables for reservations, status derivation, discovery and fanout
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quantity at or below which a listing is `low-stock`
    pub low_stock_threshold: i32,
    /// Width of the "pickup now" discovery bucket, in hours
    pub pickup_now_window_hours: i64,
    /// How long an idempotency key replays its original result, in seconds
    pub idempotency_ttl_secs: u64,
    /// Bound on a single storage attempt of a reservation, in milliseconds
    pub storage_timeout_ms: u64,
    /// Extra attempts after a transient storage failure
    pub max_storage_retries: u32,
    /// Events buffered per subscriber before it is considered lagging
    pub fanout_capacity: usize,
    /// Interval between heartbeats on realtime connections, in seconds
    pub heartbeat_interval_secs: u64,
    /// Silence after which a client cache must re-fetch, in seconds
    pub heartbeat_timeout_secs: u64,
    /// Results returned by discovery when the caller gives no limit
    pub default_discovery_limit: usize,
    /// Upper bound on the caller-supplied discovery limit
    pub max_discovery_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            low_stock_threshold: 2,
            pickup_now_window_hours: 3,
            idempotency_ttl_secs: 15 * 60,
            storage_timeout_ms: 2_000,
            max_storage_retries: 2,
            fanout_capacity: 256,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            default_discovery_limit: 50,
            max_discovery_limit: 200,
        }
    }
}

impl EngineConfig {
    /// Idempotency key lifetime
    #[must_use]
    pub const fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    /// Bound on a single storage attempt
    #[must_use]
    pub const fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// Interval between heartbeats
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence after which a client cache must re-fetch
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Width of the "pickup now" bucket
    #[must_use]
    pub fn pickup_now_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.pickup_now_window_hours)
    }

    /// Rejects values the engine cannot work with.
    ///
    /// # Errors
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.low_stock_threshold < 0 {
            return Err(config_error("engine.low_stock_threshold must not be negative"));
        }
        if self.pickup_now_window_hours <= 0 {
            return Err(config_error("engine.pickup_now_window_hours must be positive"));
        }
        if self.storage_timeout_ms == 0 {
            return Err(config_error("engine.storage_timeout_ms must be positive"));
        }
        if self.fanout_capacity == 0 {
            return Err(config_error("engine.fanout_capacity must be positive"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(config_error("engine.heartbeat_interval_secs must be positive"));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(config_error(
                "engine.heartbeat_timeout_secs must not be shorter than the heartbeat interval",
            ));
        }
        if self.default_discovery_limit == 0
            || self.default_discovery_limit > self.max_discovery_limit
        {
            return Err(config_error(
                "engine.default_discovery_limit must be between 1 and max_discovery_limit",
            ));
        }
        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub bind_address: String,
    /// Interval of the expiry and idempotency sweeper, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Interval of the housekeeping sweeper
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Configuration for a single seeded business
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusinessSeed {
    /// Display name, also used to detect an existing row
    pub name: String,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
}

fn config_error(message: &str) -> Error {
    Error::Config {
        message: message.to_string(),
    }
}

/// Loads application configuration from a TOML file
///
/// # Arguments
/// * `path` - Path to the config.toml file
///
/// # Returns
/// * `Ok(AppConfig)` - Successfully parsed and validated configuration
/// * `Err(Error)` - Failed to read, parse or validate the configuration file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - An engine value is out of range
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file: {e}"),
    })?;

    parse_config(&contents)
}

/// Parses and validates configuration text.
pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })?;
    config.engine.validate()?;
    if config.server.sweep_interval_secs == 0 {
        return Err(config_error("server.sweep_interval_secs must be positive"));
    }
    Ok(config)
}

/// Loads configuration from `CONFIG_PATH` (default `./config.toml`), falling back
/// to built-in defaults when the file does not exist.
///
/// # Returns
/// * `Ok(AppConfig)` - Parsed or default configuration
/// * `Err(Error)` - The file exists but could not be read or parsed
pub fn load_default_config() -> Result<AppConfig> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    if Path::new(&path).exists() {
        load_config(&path)
    } else {
        tracing::warn!("Config file {} not found, using defaults", path);
        Ok(AppConfig::default())
    }
}
