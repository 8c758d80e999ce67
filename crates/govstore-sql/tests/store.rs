//! Singleton domains, transactions, timeouts and change notification

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use sqlx::Connection;

use common::{open_store, provider_set, sqlite_settings};
use govstore_core::config_store::{ConfigDomain, ConfigReloadHook};
use govstore_core::model::{
    ClientConfig, ConfigEntry, EnvKeyBinding, EnvKeyType, LogStoreBackend, LogStoreConfig,
    McpClientConfig, McpConnectionType, ModelPricing, Plugin, PostgresConnection,
    VectorStoreBackend, VectorStoreConfig,
};
use govstore_core::{Error, REDACTED};
use govstore_sql::ConfigStore;

#[derive(Default)]
struct RecordingHook {
    seen: Mutex<Vec<ClientConfig>>,
}

#[async_trait]
impl ConfigReloadHook for RecordingHook {
    async fn client_config_changed(&self, config: &ClientConfig) {
        self.seen.lock().push(config.clone());
    }
}

#[tokio::test]
async fn test_client_config_update_runs_reload_hook() {
    let (_dir, store) = open_store().await;
    let hook = Arc::new(RecordingHook::default());
    store.set_reload_hook(hook.clone());

    assert!(store.get_client_config().await.unwrap().is_none());

    let config = ClientConfig {
        drop_excess_requests: true,
        allowed_origins: vec!["https://console.example.com".to_string()],
        ..Default::default()
    };
    store.update_client_config(None, config.clone()).await.unwrap();
    assert_eq!(store.get_client_config().await.unwrap(), Some(config.clone()));

    // Replaced, not appended
    let second = ClientConfig {
        initial_pool_size: 50,
        ..config
    };
    store.update_client_config(None, second.clone()).await.unwrap();
    assert_eq!(store.get_client_config().await.unwrap(), Some(second.clone()));

    let seen = hook.seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1], second);
}

#[tokio::test]
async fn test_reload_hook_waits_for_commit() {
    let (_dir, store) = open_store().await;
    let hook = Arc::new(RecordingHook::default());
    store.set_reload_hook(hook.clone());

    let mut tx = store.begin_transaction().await.unwrap();
    store
        .update_client_config(Some(&mut tx), ClientConfig::default())
        .await
        .unwrap();
    assert!(hook.seen.lock().is_empty());
    tx.rollback().await.unwrap();

    assert!(hook.seen.lock().is_empty());
    assert!(store.get_client_config().await.unwrap().is_none());
}

#[tokio::test]
async fn test_watch_changes_sees_committed_domains() {
    let (_dir, store) = open_store().await;
    let mut changes = store.watch_changes();

    store.update_providers(None, provider_set()).await.unwrap();

    let mut tx = store.begin_transaction().await.unwrap();
    store
        .update_config_entry(Some(&mut tx), ConfigEntry::new("theme", "dark"))
        .await
        .unwrap();
    store
        .create_plugin(
            Some(&mut tx),
            Plugin {
                name: "telemetry".to_string(),
                enabled: true,
                config: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let first = changes.next().await.unwrap();
    let second = changes.next().await.unwrap();
    let third = changes.next().await.unwrap();
    assert_eq!(first.domain, ConfigDomain::Providers);
    assert_eq!(second.domain, ConfigDomain::ConfigEntries);
    assert_eq!(third.domain, ConfigDomain::Plugins);
    assert!(first.version < second.version && second.version < third.version);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();

    {
        let mut tx = store.begin_transaction().await.unwrap();
        store
            .delete_provider(Some(&mut tx), "openai")
            .await
            .unwrap();
        store
            .update_config_entry(Some(&mut tx), ConfigEntry::new("k", "v"))
            .await
            .unwrap();
    }

    assert_eq!(store.get_providers().await.unwrap().len(), 2);
    assert!(store.get_config_entry("k").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_failed_step_leaves_previous_state() {
    let (_dir, store) = open_store().await;
    store.update_providers(None, provider_set()).await.unwrap();

    let mut tx = store.begin_transaction().await.unwrap();
    store
        .delete_provider(Some(&mut tx), "anthropic")
        .await
        .unwrap();
    let err = store
        .delete_plugin(Some(&mut tx), "never-installed")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    drop(tx);

    let providers = store.get_providers_unredacted().await.unwrap();
    assert_eq!(providers["anthropic"].keys[0].value, "sk-ant-three");
}

#[tokio::test]
async fn test_owned_transaction_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = sqlite_settings(dir.path(), "config.db");
    settings.max_connections = 1;
    settings.min_connections = 0;
    let store = ConfigStore::open(settings).await.unwrap();

    // Holds the only pooled connection
    let tx = store.begin_transaction().await.unwrap();

    let bounded = store.with_operation_timeout(Duration::from_millis(100));
    assert_eq!(bounded.operation_timeout(), Duration::from_millis(100));
    let err = bounded.get_plugins().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "unexpected error: {}", err);

    drop(tx);
    assert!(bounded.get_plugins().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_plugin_lifecycle() {
    let (_dir, store) = open_store().await;
    let plugin = Plugin {
        name: "semantic-cache".to_string(),
        enabled: false,
        config: serde_json::json!({"ttl": 300}),
    };

    store.create_plugin(None, plugin.clone()).await.unwrap();
    let err = store.create_plugin(None, plugin.clone()).await.unwrap_err();
    assert!(err.is_conflict());

    let updated = Plugin {
        enabled: true,
        ..plugin.clone()
    };
    store.update_plugin(None, updated.clone()).await.unwrap();
    assert_eq!(store.get_plugin("semantic-cache").await.unwrap(), updated);
    assert_eq!(store.get_plugins().await.unwrap().len(), 1);

    let ghost = Plugin {
        name: "ghost".to_string(),
        ..plugin
    };
    assert!(store.update_plugin(None, ghost).await.unwrap_err().is_not_found());

    store.delete_plugin(None, "semantic-cache").await.unwrap();
    assert!(store.get_plugin("semantic-cache").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_config_entries_upsert() {
    let (_dir, store) = open_store().await;

    store
        .update_config_entry(None, ConfigEntry::new("framework.version", "1"))
        .await
        .unwrap();
    store
        .update_config_entry(None, ConfigEntry::new("framework.version", "2"))
        .await
        .unwrap();
    assert_eq!(
        store.get_config_entry("framework.version").await.unwrap().value,
        "2"
    );

    let err = store
        .update_config_entry(None, ConfigEntry::new(" ", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_model_prices() {
    let (_dir, store) = open_store().await;
    let price = |model: &str| ModelPricing {
        model: model.to_string(),
        provider: "openai".to_string(),
        input_cost_per_token: 0.000_002_5,
        output_cost_per_token: 0.000_01,
        mode: "chat".to_string(),
    };

    let mut tx = store.begin_transaction().await.unwrap();
    store.create_model_price(Some(&mut tx), price("gpt-4o")).await.unwrap();
    store
        .create_model_price(Some(&mut tx), price("gpt-4o-mini"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let prices = store.get_model_prices().await.unwrap();
    assert_eq!(prices.len(), 2);
    assert_eq!(prices[0].model, "gpt-4o");

    assert!(store.create_model_price(None, price("gpt-4o")).await.unwrap_err().is_conflict());

    assert_eq!(store.delete_model_prices(None).await.unwrap(), 2);
    assert!(store.get_model_prices().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mcp_clients_replace() {
    let (_dir, store) = open_store().await;
    let client = McpClientConfig {
        name: "search".to_string(),
        connection_type: McpConnectionType::Http,
        connection_string: Some("http://localhost:3001/mcp".to_string()),
        stdio_config: None,
        tools_to_execute: vec!["web_search".to_string()],
        tools_to_skip: Vec::new(),
    };

    store
        .update_mcp_clients(None, vec![client.clone()])
        .await
        .unwrap();
    assert_eq!(store.get_mcp_clients().await.unwrap(), vec![client.clone()]);

    let err = store
        .update_mcp_clients(None, vec![client.clone(), client])
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    store.update_mcp_clients(None, Vec::new()).await.unwrap();
    assert!(store.get_mcp_clients().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_env_key_bindings_replace() {
    let (_dir, store) = open_store().await;
    let mut bindings = BTreeMap::new();
    bindings.insert(
        "OPENAI_API_KEY".to_string(),
        vec![EnvKeyBinding {
            env_var: "OPENAI_API_KEY".to_string(),
            provider: "openai".to_string(),
            key_type: EnvKeyType::ApiKey,
            config_path: "providers.openai.keys[k1].value".to_string(),
            key_id: "k1".to_string(),
        }],
    );

    store.update_env_keys(None, bindings.clone()).await.unwrap();
    assert_eq!(store.get_env_keys().await.unwrap(), bindings);
}

#[tokio::test]
async fn test_vector_store_secret_round_trip() {
    let (_dir, store) = open_store().await;
    let config = VectorStoreConfig {
        enabled: true,
        backend: VectorStoreBackend::Redis {
            addr: "localhost:6379".to_string(),
            username: None,
            password: Some("hunter2".to_string()),
            db: 0,
        },
    };
    store
        .update_vector_store_config(None, config.clone())
        .await
        .unwrap();

    let redacted = store.get_vector_store_config().await.unwrap().unwrap();
    match &redacted.backend {
        VectorStoreBackend::Redis { password, .. } => {
            assert_eq!(password.as_deref(), Some(REDACTED))
        }
        other => panic!("unexpected backend {:?}", other),
    }

    // Echo back with a toggled flag
    let echoed = VectorStoreConfig {
        enabled: false,
        ..redacted
    };
    store.update_vector_store_config(None, echoed).await.unwrap();
    let plain = store
        .get_vector_store_config_unredacted()
        .await
        .unwrap()
        .unwrap();
    assert!(!plain.enabled);
    assert_eq!(plain.backend, config.backend);
}

#[tokio::test]
async fn test_log_store_variant_change_takes_new_value() {
    let (_dir, store) = open_store().await;
    let postgres = LogStoreConfig {
        enabled: true,
        backend: LogStoreBackend::Postgres(PostgresConnection {
            host: "db.internal".to_string(),
            port: 5432,
            user: "logs".to_string(),
            password: "s3cret".to_string(),
            db_name: "logs".to_string(),
            ssl_mode: String::new(),
        }),
    };
    store.update_log_store_config(None, postgres).await.unwrap();

    let sqlite = LogStoreConfig {
        enabled: true,
        backend: LogStoreBackend::Sqlite {
            path: "/var/lib/gateway/logs.db".into(),
        },
    };
    store
        .update_log_store_config(None, sqlite.clone())
        .await
        .unwrap();
    assert_eq!(
        store.get_log_store_config_unredacted().await.unwrap(),
        Some(sqlite)
    );
}

#[tokio::test]
async fn test_log_store_sentinel_after_variant_change_is_rejected() {
    let (_dir, store) = open_store().await;
    store
        .update_log_store_config(
            None,
            LogStoreConfig {
                enabled: true,
                backend: LogStoreBackend::Sqlite {
                    path: "/tmp/logs.db".into(),
                },
            },
        )
        .await
        .unwrap();

    let err = store
        .update_log_store_config(
            None,
            LogStoreConfig {
                enabled: true,
                backend: LogStoreBackend::Postgres(PostgresConnection {
                    host: "db".to_string(),
                    port: 5432,
                    user: "logs".to_string(),
                    password: REDACTED.to_string(),
                    db_name: "logs".to_string(),
                    ssl_mode: String::new(),
                }),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_queue_on_sqlite() {
    let (_dir, store) = open_store().await;

    let mut writers = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        writers.push(tokio::spawn(async move {
            store.update_providers(None, provider_set()).await?;
            store
                .update_config_entry(None, ConfigEntry::new(format!("writer-{}", i), "done"))
                .await
        }));
    }
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    for i in 0..8 {
        let entry = store.get_config_entry(&format!("writer-{}", i)).await.unwrap();
        assert_eq!(entry.value, "done");
    }
    let providers = store.get_providers_unredacted().await.unwrap();
    assert_eq!(providers["openai"].keys.len(), 2);
    assert_eq!(providers["anthropic"].keys.len(), 1);
}

#[tokio::test]
async fn test_open_creates_missing_directories_in_wal_mode() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(sqlite_settings(dir.path(), "nested/deeper/config.db"))
        .await
        .unwrap();
    store
        .update_config_entry(None, ConfigEntry::new("opened", "yes"))
        .await
        .unwrap();
    store.close().await;

    let path = dir.path().join("nested/deeper/config.db");
    assert!(path.exists());

    sqlx::any::install_default_drivers();
    let mut conn = sqlx::AnyConnection::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&mut conn)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}
