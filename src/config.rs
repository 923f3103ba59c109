//! Cluster topology configuration.
//!
//! The YAML schema belongs to the external cluster manager; the harness only
//! interprets the chain id and each validator's base port. Everything else is
//! carried along untouched so post-init hooks can inspect the full document.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    ReadFile(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("cluster config defines no validators")]
    NoValidators,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub chain_id: String,

    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub base_port: u16,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;

        Ok(config)
    }

    /// The validator whose endpoints gate cluster readiness.
    pub fn first_validator(&self) -> Result<&ValidatorConfig, ConfigError> {
        self.validators.first().ok_or(ConfigError::NoValidators)
    }
}
