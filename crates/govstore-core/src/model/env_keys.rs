//! Environment variable → credential slot bindings

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Bindings grouped by environment variable name
pub type EnvKeyBindingSet = BTreeMap<String, Vec<EnvKeyBinding>>;

/// Kind of slot an environment variable populates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvKeyType {
    ApiKey,
    AzureConfig,
    VertexConfig,
    BedrockConfig,
    Connection,
}

impl EnvKeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::AzureConfig => "azure_config",
            Self::VertexConfig => "vertex_config",
            Self::BedrockConfig => "bedrock_config",
            Self::Connection => "connection",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "api_key" => Ok(Self::ApiKey),
            "azure_config" => Ok(Self::AzureConfig),
            "vertex_config" => Ok(Self::VertexConfig),
            "bedrock_config" => Ok(Self::BedrockConfig),
            "connection" => Ok(Self::Connection),
            other => Err(Error::Validation(format!("Unknown env key type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvKeyBinding {
    pub env_var: String,

    /// Empty for bindings that are not provider scoped
    #[serde(default)]
    pub provider: String,

    pub key_type: EnvKeyType,

    /// Dotted path of the field populated from the variable
    pub config_path: String,

    #[serde(default)]
    pub key_id: String,
}

/// Every binding must be filed under its own variable name
pub fn validate_env_keys(set: &EnvKeyBindingSet) -> Result<()> {
    for (env_var, bindings) in set {
        if env_var.trim().is_empty() {
            return Err(Error::Validation(
                "Environment variable name must not be empty".to_string(),
            ));
        }
        if let Some(binding) = bindings.iter().find(|b| &b.env_var != env_var) {
            return Err(Error::Validation(format!(
                "Binding for {} is filed under {}",
                binding.env_var, env_var
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatched_env_var_rejected() {
        let mut set = EnvKeyBindingSet::new();
        set.insert(
            "OPENAI_API_KEY".to_string(),
            vec![EnvKeyBinding {
                env_var: "ANTHROPIC_API_KEY".to_string(),
                provider: "anthropic".to_string(),
                key_type: EnvKeyType::ApiKey,
                config_path: "providers.anthropic.keys[0].value".to_string(),
                key_id: "k1".to_string(),
            }],
        );
        assert!(validate_env_keys(&set).is_err());
    }

    #[test]
    fn test_key_type_round_trip() {
        for ty in [EnvKeyType::ApiKey, EnvKeyType::BedrockConfig, EnvKeyType::Connection] {
            assert_eq!(EnvKeyType::parse(ty.as_str()).unwrap(), ty);
        }
    }
}
