//! Process-wide runtime switches and generic key/value settings

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Singleton runtime configuration of the gateway process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub drop_excess_requests: bool,

    #[serde(default = "default_initial_pool_size")]
    pub initial_pool_size: u32,

    #[serde(default)]
    pub prometheus_labels: Vec<String>,

    #[serde(default = "default_true")]
    pub enable_logging: bool,

    #[serde(default = "default_true")]
    pub enable_governance: bool,

    #[serde(default)]
    pub enforce_governance_header: bool,

    #[serde(default)]
    pub allow_direct_keys: bool,

    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_initial_pool_size() -> u32 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            drop_excess_requests: false,
            initial_pool_size: default_initial_pool_size(),
            prometheus_labels: Vec::new(),
            enable_logging: true,
            enable_governance: true,
            enforce_governance_header: false,
            allow_direct_keys: false,
            allowed_origins: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_pool_size == 0 {
            return Err(Error::Validation(
                "initial_pool_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Free-form setting stored under a unique key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

impl ConfigEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
