//! Secret redaction on read, secret reconstruction on write
//!
//! Reads hand out configurations with every secret replaced by [`REDACTED`].
//! When such a configuration is echoed back, [`Redact::merge_secrets`] swaps
//! each sentinel for the plaintext stored before the update. A field holding
//! anything other than the sentinel is a new value and is kept as given.

use std::collections::HashMap;

use crate::model::{
    BackendConfig, Key, LogStoreBackend, LogStoreConfig, PostgresConnection, ProviderConfig,
    ProviderSet, ProxyConfig, VectorStoreBackend, VectorStoreConfig,
};
use crate::{Error, Result};

/// Placeholder returned in place of a secret
pub const REDACTED: &str = "<redacted>";

pub trait Redact: Sized {
    /// Copy with every non-empty secret replaced by the sentinel
    fn redacted(&self) -> Self;

    /// Resolve sentinels in `self` against the previously stored value
    fn merge_secrets(self, previous: &Self) -> Self;

    /// All secret fields currently set
    fn secrets(&self) -> Vec<&str>;
}

pub fn is_redacted(value: &str) -> bool {
    value == REDACTED
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        REDACTED.to_string()
    }
}

fn redact_opt(secret: &Option<String>) -> Option<String> {
    secret.as_deref().map(redact)
}

/// Keep `old` only when `new` is the sentinel
pub fn merge_secret(new: String, old: &str) -> String {
    if is_redacted(&new) { old.to_string() } else { new }
}

fn merge_secret_opt(new: Option<String>, old: Option<&String>) -> Option<String> {
    match (new, old) {
        (Some(new), Some(old)) if is_redacted(&new) => Some(old.clone()),
        (new, _) => new,
    }
}

/// Reject a value that still carries a sentinel after merging.
///
/// Happens when the caller echoes a placeholder for a secret that was never
/// stored; persisting it would replace a credential with the placeholder.
pub fn ensure_resolved<T: Redact>(value: &T, what: &str) -> Result<()> {
    if value.secrets().into_iter().any(is_redacted) {
        return Err(Error::Validation(format!(
            "{} contains a redacted secret with no stored value to restore",
            what
        )));
    }
    Ok(())
}

impl Redact for Key {
    fn redacted(&self) -> Self {
        let mut key = self.clone();
        key.value = redact(&key.value);
        if let Some(vertex) = key.vertex.as_mut() {
            vertex.auth_credentials = redact(&vertex.auth_credentials);
        }
        if let Some(bedrock) = key.bedrock.as_mut() {
            bedrock.secret_key = redact(&bedrock.secret_key);
            bedrock.session_token = redact_opt(&bedrock.session_token);
        }
        key
    }

    fn merge_secrets(mut self, previous: &Self) -> Self {
        self.value = merge_secret(self.value, &previous.value);
        if let (Some(vertex), Some(old)) = (self.vertex.as_mut(), previous.vertex.as_ref()) {
            vertex.auth_credentials =
                merge_secret(std::mem::take(&mut vertex.auth_credentials), &old.auth_credentials);
        }
        if let (Some(bedrock), Some(old)) = (self.bedrock.as_mut(), previous.bedrock.as_ref()) {
            bedrock.secret_key = merge_secret(std::mem::take(&mut bedrock.secret_key), &old.secret_key);
            bedrock.session_token =
                merge_secret_opt(bedrock.session_token.take(), old.session_token.as_ref());
        }
        self
    }

    fn secrets(&self) -> Vec<&str> {
        let mut out = vec![self.value.as_str()];
        if let Some(vertex) = &self.vertex {
            out.push(&vertex.auth_credentials);
        }
        if let Some(bedrock) = &self.bedrock {
            out.push(&bedrock.secret_key);
            out.extend(bedrock.session_token.as_deref());
        }
        out
    }
}

impl Redact for ProviderConfig {
    fn redacted(&self) -> Self {
        let mut provider = self.clone();
        provider.keys = self.keys.iter().map(Key::redacted).collect();
        if let Some(proxy) = provider.proxy_config.as_mut() {
            proxy.password = redact_opt(&proxy.password);
        }
        provider
    }

    fn merge_secrets(self, previous: &Self) -> Self {
        let old_keys = keys_by_id(std::slice::from_ref(previous));
        merge_provider(self, &old_keys, previous.proxy_config.as_ref())
    }

    fn secrets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.keys.iter().flat_map(Key::secrets).collect();
        if let Some(proxy) = &self.proxy_config {
            out.extend(proxy.password.as_deref());
        }
        out
    }
}

fn keys_by_id<'a>(
    providers: impl IntoIterator<Item = &'a ProviderConfig>,
) -> HashMap<&'a str, &'a Key> {
    providers
        .into_iter()
        .flat_map(|p| p.keys.iter())
        .map(|k| (k.id.as_str(), k))
        .collect()
}

/// Restore key secrets matched by key id, and the proxy password
fn merge_provider(
    mut provider: ProviderConfig,
    old_keys: &HashMap<&str, &Key>,
    old_proxy: Option<&ProxyConfig>,
) -> ProviderConfig {
    provider.keys = std::mem::take(&mut provider.keys)
        .into_iter()
        .map(|key| match old_keys.get(key.id.as_str()) {
            Some(old) => key.merge_secrets(old),
            None => key,
        })
        .collect();
    if let (Some(proxy), Some(old)) = (provider.proxy_config.as_mut(), old_proxy) {
        proxy.password = merge_secret_opt(proxy.password.take(), old.password.as_ref());
    }
    provider
}

/// Keys are matched by id across the whole set, so a key moved between
/// providers keeps its stored secret.
impl Redact for ProviderSet {
    fn redacted(&self) -> Self {
        self.iter()
            .map(|(name, provider)| (name.clone(), provider.redacted()))
            .collect()
    }

    fn merge_secrets(self, previous: &Self) -> Self {
        let old_keys = keys_by_id(previous.values());
        self.into_iter()
            .map(|(name, provider)| {
                let old_proxy = previous.get(&name).and_then(|p| p.proxy_config.as_ref());
                let merged = merge_provider(provider, &old_keys, old_proxy);
                (name, merged)
            })
            .collect()
    }

    fn secrets(&self) -> Vec<&str> {
        self.values().flat_map(ProviderConfig::secrets).collect()
    }
}

impl Redact for PostgresConnection {
    fn redacted(&self) -> Self {
        Self {
            password: redact(&self.password),
            ..self.clone()
        }
    }

    fn merge_secrets(mut self, previous: &Self) -> Self {
        self.password = merge_secret(self.password, &previous.password);
        self
    }

    fn secrets(&self) -> Vec<&str> {
        vec![&self.password]
    }
}

impl Redact for VectorStoreConfig {
    fn redacted(&self) -> Self {
        let backend = match &self.backend {
            VectorStoreBackend::Weaviate {
                scheme,
                host,
                api_key,
                class_prefix,
            } => VectorStoreBackend::Weaviate {
                scheme: scheme.clone(),
                host: host.clone(),
                api_key: redact_opt(api_key),
                class_prefix: class_prefix.clone(),
            },
            VectorStoreBackend::Redis {
                addr,
                username,
                password,
                db,
            } => VectorStoreBackend::Redis {
                addr: addr.clone(),
                username: username.clone(),
                password: redact_opt(password),
                db: *db,
            },
        };
        Self {
            enabled: self.enabled,
            backend,
        }
    }

    fn merge_secrets(mut self, previous: &Self) -> Self {
        match (&mut self.backend, &previous.backend) {
            (
                VectorStoreBackend::Weaviate { api_key, .. },
                VectorStoreBackend::Weaviate { api_key: old, .. },
            ) => *api_key = merge_secret_opt(api_key.take(), old.as_ref()),
            (
                VectorStoreBackend::Redis { password, .. },
                VectorStoreBackend::Redis { password: old, .. },
            ) => *password = merge_secret_opt(password.take(), old.as_ref()),
            // Variant changed: nothing of the old secrets applies
            _ => {}
        }
        self
    }

    fn secrets(&self) -> Vec<&str> {
        match &self.backend {
            VectorStoreBackend::Weaviate { api_key, .. } => api_key.as_deref().into_iter().collect(),
            VectorStoreBackend::Redis { password, .. } => password.as_deref().into_iter().collect(),
        }
    }
}

impl Redact for LogStoreConfig {
    fn redacted(&self) -> Self {
        let backend = match &self.backend {
            LogStoreBackend::Postgres(pg) => LogStoreBackend::Postgres(pg.redacted()),
            other => other.clone(),
        };
        Self {
            enabled: self.enabled,
            backend,
        }
    }

    fn merge_secrets(self, previous: &Self) -> Self {
        let backend = match (self.backend, &previous.backend) {
            (LogStoreBackend::Postgres(pg), LogStoreBackend::Postgres(old)) => {
                LogStoreBackend::Postgres(pg.merge_secrets(old))
            }
            (backend, _) => backend,
        };
        Self {
            enabled: self.enabled,
            backend,
        }
    }

    fn secrets(&self) -> Vec<&str> {
        match &self.backend {
            LogStoreBackend::Postgres(pg) => pg.secrets(),
            LogStoreBackend::Sqlite { .. } => Vec::new(),
        }
    }
}

impl Redact for BackendConfig {
    fn redacted(&self) -> Self {
        match self {
            Self::Postgres(pg) => Self::Postgres(pg.redacted()),
            other => other.clone(),
        }
    }

    fn merge_secrets(self, previous: &Self) -> Self {
        match (self, previous) {
            (Self::Postgres(pg), Self::Postgres(old)) => Self::Postgres(pg.merge_secrets(old)),
            (backend, _) => backend,
        }
    }

    fn secrets(&self) -> Vec<&str> {
        match self {
            Self::Postgres(pg) => pg.secrets(),
            Self::Sqlite { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BedrockKeyConfig, ProxyConfig, ProxyType};

    fn openai() -> ProviderConfig {
        ProviderConfig {
            keys: vec![Key::new("k1", "sk-abc", 1.0)],
            proxy_config: Some(ProxyConfig {
                proxy_type: ProxyType::Http,
                url: Some("http://proxy:8080".to_string()),
                username: Some("proxy".to_string()),
                password: Some("hunter2".to_string()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_redacted_hides_every_secret() {
        let redacted = openai().redacted();
        assert_eq!(redacted.keys[0].value, REDACTED);
        assert_eq!(
            redacted.proxy_config.unwrap().password.as_deref(),
            Some(REDACTED)
        );
    }

    #[test]
    fn test_echoed_sentinel_restores_plaintext() {
        let stored = openai();
        let merged = stored.redacted().merge_secrets(&stored);
        assert_eq!(merged, stored);
        assert!(ensure_resolved(&merged, "provider").is_ok());
    }

    #[test]
    fn test_new_value_wins_over_stored() {
        let stored = openai();
        let mut update = stored.redacted();
        update.keys[0].value = "sk-new".to_string();
        let merged = update.merge_secrets(&stored);
        assert_eq!(merged.keys[0].value, "sk-new");
    }

    #[test]
    fn test_unknown_key_keeps_sentinel_and_fails_resolution() {
        let stored = openai();
        let mut update = stored.redacted();
        update.keys[0].id = "k2".to_string();
        let merged = update.merge_secrets(&stored);
        assert!(ensure_resolved(&merged, "provider").is_err());
    }

    #[test]
    fn test_provider_set_merges_keys_across_providers() {
        let mut previous = ProviderSet::new();
        previous.insert("openai".to_string(), openai());

        let mut update = ProviderSet::new();
        update.insert(
            "azure".to_string(),
            ProviderConfig {
                keys: vec![Key::new("k1", REDACTED, 2.0)],
                ..Default::default()
            },
        );

        let merged = update.merge_secrets(&previous);
        assert_eq!(merged["azure"].keys[0].value, "sk-abc");
    }

    #[test]
    fn test_provider_set_merge_matches_single_provider_merge() {
        let mut previous = ProviderSet::new();
        previous.insert("openai".to_string(), openai());
        let update = previous.redacted();

        let merged_set = update.clone().merge_secrets(&previous);
        let merged_one = update["openai"].clone().merge_secrets(&previous["openai"]);
        assert_eq!(merged_set["openai"], merged_one);
        assert_eq!(
            merged_one.proxy_config.unwrap().password.as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn test_proxy_password_is_not_borrowed_from_another_provider() {
        let mut previous = ProviderSet::new();
        previous.insert("openai".to_string(), openai());

        let mut update = ProviderSet::new();
        let mut azure = openai().redacted();
        azure.keys.clear();
        update.insert("azure".to_string(), azure);

        let merged = update.merge_secrets(&previous);
        assert_eq!(
            merged["azure"].proxy_config.as_ref().unwrap().password.as_deref(),
            Some(REDACTED)
        );
    }

    #[test]
    fn test_bedrock_secrets_merge() {
        let mut stored = Key::new("k1", "akid", 1.0);
        stored.bedrock = Some(BedrockKeyConfig {
            access_key: "AKIA".to_string(),
            secret_key: "shh".to_string(),
            session_token: Some("tok".to_string()),
            region: Some("us-east-1".to_string()),
            arn: None,
        });

        let redacted = stored.redacted();
        let bedrock = redacted.bedrock.as_ref().unwrap();
        assert_eq!(bedrock.secret_key, REDACTED);
        assert_eq!(bedrock.access_key, "AKIA");

        assert_eq!(redacted.merge_secrets(&stored), stored);
    }

    #[test]
    fn test_empty_secret_is_not_redacted() {
        let key = Key::new("k1", "", 1.0);
        assert_eq!(key.redacted().value, "");
    }

    #[test]
    fn test_vector_store_merge_is_variant_scoped() {
        let stored = VectorStoreConfig {
            enabled: true,
            backend: VectorStoreBackend::Weaviate {
                scheme: "https".to_string(),
                host: "weaviate:8080".to_string(),
                api_key: Some("wv-secret".to_string()),
                class_prefix: None,
            },
        };

        let same_variant = stored.redacted().merge_secrets(&stored);
        assert_eq!(same_variant, stored);

        let switched = VectorStoreConfig {
            enabled: true,
            backend: VectorStoreBackend::Redis {
                addr: "redis:6379".to_string(),
                username: None,
                password: Some(REDACTED.to_string()),
                db: 0,
            },
        };
        let merged = switched.clone().merge_secrets(&stored);
        assert_eq!(merged, switched);
        assert!(ensure_resolved(&merged, "vector store").is_err());
    }

    #[test]
    fn test_backend_config_merge() {
        let stored = BackendConfig::Postgres(PostgresConnection {
            host: "localhost".to_string(),
            port: 5432,
            user: "gov".to_string(),
            password: "pw".to_string(),
            db_name: "config".to_string(),
            ssl_mode: String::new(),
        });
        assert_eq!(stored.redacted().merge_secrets(&stored), stored);

        let sqlite = BackendConfig::sqlite("/tmp/config.db");
        assert_eq!(sqlite.clone().merge_secrets(&stored), sqlite);
    }
}
