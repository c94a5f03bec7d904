use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::ca::DEFAULT_LEAF_VALIDITY;
use crate::cache::DEFAULT_SWEEP_INTERVAL;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Certificate cache configuration file format.
///
/// Durations are written in humantime form, e.g. `10m` or `1h 30m`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a signed certificate is served from the cache.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How often expired certificates are purged from memory.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Upper bound on waiting for the generation slot. Unset waits forever.
    #[serde(default, with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,

    /// Lifetime of the leaf certificates themselves.
    #[serde(default = "default_leaf_validity", with = "humantime_serde")]
    pub leaf_validity: Duration,
}

fn default_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_leaf_validity() -> Duration {
    DEFAULT_LEAF_VALIDITY
}

impl CacheConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::Invalid("ttl must be non-zero".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sweep_interval must be non-zero".to_string(),
            ));
        }
        // A cached leaf must stay valid for as long as it can be served.
        if self.leaf_validity < self.ttl {
            return Err(ConfigError::Invalid(format!(
                "leaf_validity ({}) is shorter than ttl ({})",
                humantime::format_duration(self.leaf_validity),
                humantime::format_duration(self.ttl)
            )));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            sweep_interval: default_sweep_interval(),
            acquire_timeout: None,
            leaf_validity: default_leaf_validity(),
        }
    }
}
