//! Singleton rows: vector store, log store and the active-backend descriptor

use sqlx::AnyConnection;
use tracing::debug;

use govstore_core::Result;
use govstore_core::model::{BackendConfig, LogStoreConfig, VectorStoreConfig};

use super::{col, col_bool, flag, now};
use crate::error::{DbResultExt, from_json, to_json};

const VECTOR_STORE: &str = "config_vector_store";
const LOG_STORE: &str = "config_log_store";

/// `(enabled, config JSON)` of a store singleton
async fn get_store_row(conn: &mut AnyConnection, table: &str) -> Result<Option<(bool, String)>> {
    let row = sqlx::query(&format!(
        "SELECT enabled, config FROM {} ORDER BY id LIMIT 1",
        table
    ))
    .fetch_optional(&mut *conn)
    .await
    .db_context(&format!("Failed to query {}", table))?;

    match row {
        Some(row) => Ok(Some((col_bool(&row, "enabled")?, col(&row, "config")?))),
        None => Ok(None),
    }
}

async fn replace_store_row(
    conn: &mut AnyConnection,
    table: &str,
    store_type: &str,
    enabled: bool,
    config: String,
) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {}", table))
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to clear {}", table))?;

    sqlx::query(&format!(
        "INSERT INTO {} (store_type, enabled, config, updated_at) VALUES ($1, $2, $3, $4)",
        table
    ))
    .bind(store_type)
    .bind(flag(enabled))
    .bind(config)
    .bind(now())
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert {}", table))?;

    debug!("Replaced {} ({})", table, store_type);
    Ok(())
}

pub async fn get_vector_store(conn: &mut AnyConnection) -> Result<Option<VectorStoreConfig>> {
    match get_store_row(conn, VECTOR_STORE).await? {
        Some((enabled, config)) => Ok(Some(VectorStoreConfig {
            enabled,
            backend: from_json(&config, "config")?,
        })),
        None => Ok(None),
    }
}

pub async fn replace_vector_store(conn: &mut AnyConnection, config: &VectorStoreConfig) -> Result<()> {
    replace_store_row(
        conn,
        VECTOR_STORE,
        config.backend.type_name(),
        config.enabled,
        to_json(&config.backend)?,
    )
    .await
}

pub async fn get_log_store(conn: &mut AnyConnection) -> Result<Option<LogStoreConfig>> {
    match get_store_row(conn, LOG_STORE).await? {
        Some((enabled, config)) => Ok(Some(LogStoreConfig {
            enabled,
            backend: from_json(&config, "config")?,
        })),
        None => Ok(None),
    }
}

pub async fn replace_log_store(conn: &mut AnyConnection, config: &LogStoreConfig) -> Result<()> {
    replace_store_row(
        conn,
        LOG_STORE,
        config.backend.type_name(),
        config.enabled,
        to_json(&config.backend)?,
    )
    .await
}

pub async fn get_backend_descriptor(conn: &mut AnyConnection) -> Result<Option<BackendConfig>> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT config FROM config_store_backend ORDER BY id LIMIT 1")
            .fetch_optional(&mut *conn)
            .await
            .db_context("Failed to query backend descriptor")?;
    raw.map(|raw| from_json(&raw, "config")).transpose()
}

pub async fn replace_backend_descriptor(
    conn: &mut AnyConnection,
    backend: &BackendConfig,
) -> Result<()> {
    sqlx::query("DELETE FROM config_store_backend")
        .execute(&mut *conn)
        .await
        .db_context("Failed to clear backend descriptor")?;

    sqlx::query("INSERT INTO config_store_backend (store_type, config, updated_at) VALUES ($1, $2, $3)")
        .bind(backend.kind().to_string())
        .bind(to_json(backend)?)
        .bind(now())
        .execute(&mut *conn)
        .await
        .db_context("Failed to insert backend descriptor")?;

    debug!("Recorded backend descriptor: {}", backend.describe());
    Ok(())
}
