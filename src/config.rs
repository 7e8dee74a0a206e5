//! Resolved configuration
//!
//! The core consumes an already resolved [`Config`]: which driver to run,
//! the pool catalog (with per-pool erasure geometry), the default pool,
//! telemetry sink selection and logging parameters. A TOML loader is
//! provided for tools and tests; embedding applications may also build the
//! structures directly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::pool::{PoolId, PoolType};
use crate::telemetry::TelemetryStoreType;
use crate::Result;

/// Complete MIO configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend driver selection.
    #[serde(default)]
    pub driver: DriverKind,
    /// Pool catalog. At least one pool is required.
    pub pools: Vec<PoolConfig>,
    /// Name of the default pool; first pool if unset.
    #[serde(default)]
    pub default_pool: Option<String>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Which backend driver to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// In-memory backend, primarily for tests and bring-up.
    #[default]
    Mem,
}

/// One pool of the backend, with the erasure geometry the optimal IO sizes
/// are derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub id_hi: u64,
    pub id_lo: u64,
    #[serde(default)]
    pub pool_type: PoolType,
    /// Raw capacity in bytes.
    #[serde(default)]
    pub capacity: u64,
    /// Parity-group data unit size in bytes.
    #[serde(default = "default_unit_size")]
    pub unit_size: u64,
    /// Data units per parity group (N).
    #[serde(default = "default_n_data")]
    pub n_data: u64,
    /// Parity units per parity group (K).
    #[serde(default)]
    pub n_parity: u64,
    /// Devices in the pool (P).
    #[serde(default = "default_n_devices")]
    pub n_devices: u64,
}

fn default_unit_size() -> u64 {
    4096
}

fn default_n_data() -> u64 {
    1
}

fn default_n_devices() -> u64 {
    1
}

impl PoolConfig {
    pub fn id(&self) -> PoolId {
        PoolId { hi: self.id_hi, lo: self.id_lo }
    }
}

/// Telemetry sink selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub store: TelemetryStoreType,
    /// Prefix added to the beginning of each advertised record.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Output file for the binary store.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory the log file is created in. File logging is enabled only
    /// when set.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig { level: default_log_level(), dir: None }
    }
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Config::from_toml(&text)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)
            .map_err(|e| Error::invalid(format!("config parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency before the configuration is used.
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(Error::invalid("at least one pool must be configured"));
        }
        for pool in &self.pools {
            if pool.name.is_empty() || pool.name.len() > crate::pool::POOL_MAX_NAME_LEN {
                return Err(Error::invalid(format!(
                    "pool name '{}' must be 1..={} characters",
                    pool.name,
                    crate::pool::POOL_MAX_NAME_LEN
                )));
            }
            if pool.unit_size == 0 || !pool.unit_size.is_power_of_two() {
                return Err(Error::invalid(format!(
                    "pool '{}': unit_size must be a power of two",
                    pool.name
                )));
            }
            if pool.n_data == 0 || pool.n_devices == 0 {
                return Err(Error::invalid(format!(
                    "pool '{}': n_data and n_devices must be non-zero",
                    pool.name
                )));
            }
        }
        let mut names: Vec<&str> = self.pools.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.pools.len() {
            return Err(Error::invalid("duplicate pool names"));
        }
        if let Some(name) = &self.default_pool {
            if !self.pools.iter().any(|p| &p.name == name) {
                return Err(Error::invalid(format!(
                    "default pool '{}' is not in the pool catalog",
                    name
                )));
            }
        }
        Ok(())
    }

    /// A single-pool in-memory configuration, handy for tests and examples.
    pub fn mem_test_config() -> Config {
        Config {
            driver: DriverKind::Mem,
            pools: vec![PoolConfig {
                name: "default".to_string(),
                id_hi: 0,
                id_lo: 0x100,
                pool_type: PoolType::Ssd,
                capacity: 1 << 30,
                unit_size: 4096,
                n_data: 1,
                n_parity: 0,
                n_devices: 4,
            }],
            default_pool: None,
            telemetry: TelemetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}
