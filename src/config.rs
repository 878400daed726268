//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::policy::Precision;

/// Prefix for environment overrides, e.g. `TURNSTILE__STORE__PRECISION`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Orchestrator configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Path to the policy rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Bucket store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Precision mode for fixed and sliding window buckets
    #[serde(default)]
    pub precision: Precision,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long to keep waiting for evaluations after a denial, in
    /// milliseconds. Unset means wait for all of them.
    #[serde(default)]
    pub cancel_grace_ms: Option<u64>,
}

impl OrchestratorConfig {
    pub fn cancel_grace(&self) -> Option<Duration> {
        self.cancel_grace_ms.map(Duration::from_millis)
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Err(TurnstileError::Config(format!("config file '{}' not found", path)));
        }

        config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))
    }
}
