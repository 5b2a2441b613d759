//! Configuration management for quotaguard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{QuotaGuardError, Result};
use crate::ratelimit::PolicyConfig;

/// Prefix for environment variable overrides, e.g.
/// `QUOTAGUARD__JANITOR__SWEEP_INTERVAL_SECS=60`.
const ENV_PREFIX: &str = "QUOTAGUARD";

/// Main configuration for quotaguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaGuardConfig {
    /// Idle store reclamation
    #[serde(default)]
    pub janitor: JanitorConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Janitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// How often idle window stores are swept
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long past its window a store must stay quiet before it is reclaimed
    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            idle_grace_secs: default_idle_grace(),
        }
    }
}

impl JanitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_grace() -> u64 {
    300
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Operator overrides keyed by provider name, merged over the built-in defaults
    #[serde(default)]
    pub providers: HashMap<String, PolicyConfig>,
}

impl QuotaGuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGuardError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
