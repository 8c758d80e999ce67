//! Provider and provider key records

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Complete provider configuration keyed by provider name
pub type ProviderSet = BTreeMap<String, ProviderConfig>;

/// Upstream model vendor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub keys: Vec<Key>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_config: Option<NetworkConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfig>,

    #[serde(default)]
    pub send_back_raw_response: bool,

    /// Opaque settings for custom (OpenAI-compatible) providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_provider_config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,

    #[serde(default = "default_request_timeout_secs")]
    pub default_request_timeout_secs: u64,

    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_backoff_initial_ms")]
    pub retry_backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

/// Concurrency and queue limits for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub concurrency: u32,
    pub buffer_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    None,
    Http,
    Socks5,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// A credential usable for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    /// Natural key, stable across updates
    pub id: String,

    /// Secret
    pub value: String,

    /// Model allow-list (empty = all models)
    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureKeyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex: Option<VertexKeyConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock: Option<BedrockKeyConfig>,
}

fn default_weight() -> f64 {
    1.0
}

impl Key {
    pub fn new(id: impl Into<String>, value: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            models: Vec::new(),
            weight,
            azure: None,
            vertex: None,
            bedrock: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzureKeyConfig {
    pub endpoint: String,

    /// Model name → deployment name
    #[serde(default)]
    pub deployments: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexKeyConfig {
    pub project_id: String,
    pub region: String,

    /// Secret (service account JSON)
    pub auth_credentials: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedrockKeyConfig {
    pub access_key: String,

    /// Secret
    pub secret_key: String,

    /// Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
}

/// Column-limited key view used by expansion paths. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    /// Storage row id
    pub row_id: i64,
    pub key_id: String,
    pub models: Vec<String>,
}

/// Structural checks for a complete provider set submission.
///
/// Key ids are natural keys shared across providers, so a duplicate anywhere
/// in the set is a conflict.
pub fn validate_provider_set(providers: &ProviderSet) -> Result<()> {
    let mut seen = HashSet::new();

    for (name, provider) in providers {
        if name.trim().is_empty() {
            return Err(Error::Validation("Provider name must not be empty".to_string()));
        }

        if let Some(concurrency) = provider.concurrency
            && concurrency.concurrency == 0
        {
            return Err(Error::Validation(format!(
                "Provider {}: concurrency must be at least 1",
                name
            )));
        }

        for key in &provider.keys {
            if key.id.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Provider {}: key id must not be empty",
                    name
                )));
            }
            if key.value.is_empty() {
                return Err(Error::Validation(format!(
                    "Provider {}: key {} has an empty value",
                    name, key.id
                )));
            }
            if !key.weight.is_finite() || key.weight < 0.0 {
                return Err(Error::Validation(format!(
                    "Provider {}: key {} has invalid weight {}",
                    name, key.id, key.weight
                )));
            }
            if !seen.insert(key.id.as_str()) {
                return Err(Error::Conflict(format!(
                    "Key id {} is submitted more than once",
                    key.id
                )));
            }
        }
    }

    Ok(())
}
