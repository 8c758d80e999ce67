use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Installed extension descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,

    #[serde(default)]
    pub enabled: bool,

    /// Opaque plugin configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Plugin {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("Plugin name must not be empty".to_string()));
        }
        Ok(())
    }
}
