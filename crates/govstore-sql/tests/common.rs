//! Common test utilities for store integration tests

use std::collections::BTreeMap;
use std::path::Path;

use govstore_core::StoreSettings;
use govstore_core::model::{BackendConfig, Key, ProviderConfig, ProviderSet};
use govstore_sql::ConfigStore;
use tempfile::TempDir;

/// Settings for a fresh SQLite store inside `dir`
#[allow(dead_code)]
pub fn sqlite_settings(dir: &Path, file: &str) -> StoreSettings {
    StoreSettings::new(BackendConfig::sqlite(dir.join(file)))
}

/// Open a fresh SQLite store; keep the returned dir alive for the test
#[allow(dead_code)]
pub async fn open_store() -> (TempDir, ConfigStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(sqlite_settings(dir.path(), "config.db"))
        .await
        .expect("Failed to open store");
    (dir, store)
}

#[allow(dead_code)]
pub fn key(id: &str, value: &str) -> Key {
    Key::new(id, value, 1.0)
}

/// `openai` with keys k1/k2 and `anthropic` with key k3
#[allow(dead_code)]
pub fn provider_set() -> ProviderSet {
    let mut providers = BTreeMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderConfig {
            keys: vec![key("k1", "sk-one"), key("k2", "sk-two")],
            ..Default::default()
        },
    );
    providers.insert(
        "anthropic".to_string(),
        ProviderConfig {
            keys: vec![key("k3", "sk-ant-three")],
            ..Default::default()
        },
    );
    providers
}
