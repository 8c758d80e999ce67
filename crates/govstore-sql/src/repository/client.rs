use sqlx::AnyConnection;
use tracing::debug;

use govstore_core::Result;
use govstore_core::model::ClientConfig;

use super::{col, col_bool, flag, now};
use crate::error::{DbResultExt, from_json, to_json};

pub async fn get(conn: &mut AnyConnection) -> Result<Option<ClientConfig>> {
    let row = sqlx::query(
        "SELECT drop_excess_requests, initial_pool_size, prometheus_labels, enable_logging, \
         enable_governance, enforce_governance_header, allow_direct_keys, allowed_origins \
         FROM config_client ORDER BY id LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .db_context("Failed to query client config")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let pool_size: i64 = col(&row, "initial_pool_size")?;
    Ok(Some(ClientConfig {
        drop_excess_requests: col_bool(&row, "drop_excess_requests")?,
        initial_pool_size: u32::try_from(pool_size).unwrap_or(u32::MAX),
        prometheus_labels: from_json(&col::<String>(&row, "prometheus_labels")?, "prometheus_labels")?,
        enable_logging: col_bool(&row, "enable_logging")?,
        enable_governance: col_bool(&row, "enable_governance")?,
        enforce_governance_header: col_bool(&row, "enforce_governance_header")?,
        allow_direct_keys: col_bool(&row, "allow_direct_keys")?,
        allowed_origins: from_json(&col::<String>(&row, "allowed_origins")?, "allowed_origins")?,
    }))
}

/// Delete-all then insert-one, so no field of an older row survives
pub async fn replace(conn: &mut AnyConnection, config: &ClientConfig) -> Result<()> {
    sqlx::query("DELETE FROM config_client")
        .execute(&mut *conn)
        .await
        .db_context("Failed to clear client config")?;

    sqlx::query(
        "INSERT INTO config_client (drop_excess_requests, initial_pool_size, prometheus_labels, \
         enable_logging, enable_governance, enforce_governance_header, allow_direct_keys, \
         allowed_origins, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(flag(config.drop_excess_requests))
    .bind(i64::from(config.initial_pool_size))
    .bind(to_json(&config.prometheus_labels)?)
    .bind(flag(config.enable_logging))
    .bind(flag(config.enable_governance))
    .bind(flag(config.enforce_governance_header))
    .bind(flag(config.allow_direct_keys))
    .bind(to_json(&config.allowed_origins)?)
    .bind(now())
    .execute(&mut *conn)
    .await
    .db_context("Failed to insert client config")?;

    debug!("Replaced client config");
    Ok(())
}
