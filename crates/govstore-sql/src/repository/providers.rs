//! Providers and their keys
//!
//! Provider rows are replaced wholesale. Key rows are upserted by their
//! natural `key_id` so the storage row id survives an update; virtual key
//! associations point at that row id.

use std::collections::{HashMap, HashSet};

use sqlx::AnyConnection;
use sqlx::any::AnyRow;
use tracing::{debug, info};

use govstore_core::model::{Key, KeyRef, ProviderConfig, ProviderSet};
use govstore_core::{Error, Result};

use super::{col, col_bool, flag, now};
use crate::error::{DbResultExt, from_json, from_json_opt, to_json, to_json_opt};

const KEY_COLUMNS: &str =
    "id, provider, key_id, value, models, weight, azure_config, vertex_config, bedrock_config";

pub async fn get_all(conn: &mut AnyConnection) -> Result<ProviderSet> {
    let rows = sqlx::query(
        "SELECT name, network_config, concurrency, proxy_config, send_back_raw_response, \
         custom_provider_config FROM config_providers ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query providers")?;

    let mut providers = ProviderSet::new();
    for row in &rows {
        let name: String = col(row, "name")?;
        providers.insert(name, provider_from_row(row)?);
    }

    let key_rows = sqlx::query(&format!(
        "SELECT {} FROM config_keys ORDER BY id",
        KEY_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query keys")?;

    for row in &key_rows {
        let provider: String = col(row, "provider")?;
        // Keys whose provider row is gone are unreachable; they are removed on the next replace
        if let Some(config) = providers.get_mut(&provider) {
            config.keys.push(key_from_row(row)?);
        }
    }

    Ok(providers)
}

pub async fn get_one(conn: &mut AnyConnection, name: &str) -> Result<ProviderConfig> {
    let row = sqlx::query(
        "SELECT name, network_config, concurrency, proxy_config, send_back_raw_response, \
         custom_provider_config FROM config_providers WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .db_context("Failed to query provider")?
    .ok_or_else(|| Error::not_found("provider", name))?;

    let mut provider = provider_from_row(&row)?;

    let key_rows = sqlx::query(&format!(
        "SELECT {} FROM config_keys WHERE provider = $1 ORDER BY id",
        KEY_COLUMNS
    ))
    .bind(name)
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query provider keys")?;

    provider.keys = key_rows.iter().map(key_from_row).collect::<Result<_>>()?;
    Ok(provider)
}

fn provider_from_row(row: &AnyRow) -> Result<ProviderConfig> {
    Ok(ProviderConfig {
        keys: Vec::new(),
        network_config: from_json_opt(col(row, "network_config")?, "network_config")?,
        concurrency: from_json_opt(col(row, "concurrency")?, "concurrency")?,
        proxy_config: from_json_opt(col(row, "proxy_config")?, "proxy_config")?,
        send_back_raw_response: col_bool(row, "send_back_raw_response")?,
        custom_provider_config: from_json_opt(
            col(row, "custom_provider_config")?,
            "custom_provider_config",
        )?,
    })
}

fn key_from_row(row: &AnyRow) -> Result<Key> {
    Ok(Key {
        id: col(row, "key_id")?,
        value: col(row, "value")?,
        models: from_json(&col::<String>(row, "models")?, "models")?,
        weight: col(row, "weight")?,
        azure: from_json_opt(col(row, "azure_config")?, "azure_config")?,
        vertex: from_json_opt(col(row, "vertex_config")?, "vertex_config")?,
        bedrock: from_json_opt(col(row, "bedrock_config")?, "bedrock_config")?,
    })
}

/// Replace the whole provider set.
///
/// Provider rows are deleted and re-inserted. Keys are matched by natural id:
/// a match is overwritten in place, a new id is inserted, and any key (with
/// its virtual key associations) not in the submission is removed.
pub async fn replace_all(conn: &mut AnyConnection, providers: &ProviderSet) -> Result<()> {
    sqlx::query("DELETE FROM config_providers")
        .execute(&mut *conn)
        .await
        .db_context("Failed to clear providers")?;

    let stamp = now();
    let mut kept: HashSet<i64> = HashSet::new();

    for (name, provider) in providers {
        sqlx::query(
            "INSERT INTO config_providers (name, network_config, concurrency, proxy_config, \
             send_back_raw_response, custom_provider_config, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(name)
        .bind(to_json_opt(provider.network_config.as_ref())?)
        .bind(to_json_opt(provider.concurrency.as_ref())?)
        .bind(to_json_opt(provider.proxy_config.as_ref())?)
        .bind(flag(provider.send_back_raw_response))
        .bind(to_json_opt(provider.custom_provider_config.as_ref())?)
        .bind(&stamp)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to insert provider {}", name))?;

        for key in &provider.keys {
            kept.insert(upsert_key(conn, name, key, &stamp).await?);
        }
    }

    let existing: Vec<i64> = sqlx::query_scalar("SELECT id FROM config_keys")
        .fetch_all(&mut *conn)
        .await
        .db_context("Failed to list key rows")?;

    let mut removed = 0;
    for row_id in existing.into_iter().filter(|id| !kept.contains(id)) {
        delete_key_row(conn, row_id).await?;
        removed += 1;
    }

    info!(
        "Replaced {} providers ({} keys kept, {} removed)",
        providers.len(),
        kept.len(),
        removed
    );
    Ok(())
}

/// Insert or update one key by natural id, returning its storage row id
async fn upsert_key(conn: &mut AnyConnection, provider: &str, key: &Key, stamp: &str) -> Result<i64> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM config_keys WHERE key_id = $1 ORDER BY id LIMIT 1")
            .bind(&key.id)
            .fetch_optional(&mut *conn)
            .await
            .db_context(&format!("Failed to look up key {}", key.id))?;

    match existing {
        Some(row_id) => {
            // Stray rows sharing the natural id would collide with the unique index
            let strays: Vec<i64> =
                sqlx::query_scalar("SELECT id FROM config_keys WHERE key_id = $1 AND id <> $2")
                    .bind(&key.id)
                    .bind(row_id)
                    .fetch_all(&mut *conn)
                    .await
                    .db_context(&format!("Failed to look up key {}", key.id))?;
            for stray in strays {
                delete_key_row(conn, stray).await?;
            }

            sqlx::query(
                "UPDATE config_keys SET provider = $1, value = $2, models = $3, weight = $4, \
                 azure_config = $5, vertex_config = $6, bedrock_config = $7, updated_at = $8 \
                 WHERE id = $9",
            )
            .bind(provider)
            .bind(&key.value)
            .bind(to_json(&key.models)?)
            .bind(key.weight)
            .bind(to_json_opt(key.azure.as_ref())?)
            .bind(to_json_opt(key.vertex.as_ref())?)
            .bind(to_json_opt(key.bedrock.as_ref())?)
            .bind(stamp)
            .bind(row_id)
            .execute(&mut *conn)
            .await
            .db_context(&format!("Failed to update key {}", key.id))?;

            debug!("Updated key {} in place (row {})", key.id, row_id);
            Ok(row_id)
        }
        None => {
            let row_id: i64 = sqlx::query_scalar(
                "INSERT INTO config_keys (provider, key_id, value, models, weight, azure_config, \
                 vertex_config, bedrock_config, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) RETURNING id",
            )
            .bind(provider)
            .bind(&key.id)
            .bind(&key.value)
            .bind(to_json(&key.models)?)
            .bind(key.weight)
            .bind(to_json_opt(key.azure.as_ref())?)
            .bind(to_json_opt(key.vertex.as_ref())?)
            .bind(to_json_opt(key.bedrock.as_ref())?)
            .bind(stamp)
            .fetch_one(&mut *conn)
            .await
            .db_context(&format!("Failed to insert key {}", key.id))?;

            debug!("Inserted key {} (row {})", key.id, row_id);
            Ok(row_id)
        }
    }
}

async fn delete_key_row(conn: &mut AnyConnection, row_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM governance_virtual_key_keys WHERE key_row_id = $1")
        .bind(row_id)
        .execute(&mut *conn)
        .await
        .db_context("Failed to remove key associations")?;
    sqlx::query("DELETE FROM config_keys WHERE id = $1")
        .bind(row_id)
        .execute(&mut *conn)
        .await
        .db_context("Failed to remove key")?;
    Ok(())
}

/// Delete a provider together with its keys and their associations
pub async fn delete(conn: &mut AnyConnection, name: &str) -> Result<()> {
    let removed = sqlx::query("DELETE FROM config_providers WHERE name = $1")
        .bind(name)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete provider {}", name))?
        .rows_affected();
    if removed == 0 {
        return Err(Error::not_found("provider", name));
    }

    sqlx::query(
        "DELETE FROM governance_virtual_key_keys WHERE key_row_id IN \
         (SELECT id FROM config_keys WHERE provider = $1)",
    )
    .bind(name)
    .execute(&mut *conn)
    .await
    .db_context("Failed to remove key associations")?;

    let keys = sqlx::query("DELETE FROM config_keys WHERE provider = $1")
        .bind(name)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete keys of provider {}", name))?
        .rows_affected();

    info!("Deleted provider {} and {} keys", name, keys);
    Ok(())
}

/// Projected key views for the given natural ids, in request order.
///
/// Any unknown id is `NotFound`.
pub async fn keys_by_ids(conn: &mut AnyConnection, ids: &[String]) -> Result<Vec<KeyRef>> {
    let mut found: HashMap<String, KeyRef> = HashMap::new();
    for id in ids {
        if found.contains_key(id) {
            continue;
        }
        let row = sqlx::query(
            "SELECT id, key_id, models FROM config_keys WHERE key_id = $1 ORDER BY id LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .db_context(&format!("Failed to look up key {}", id))?
        .ok_or_else(|| Error::not_found("key", id))?;
        found.insert(id.clone(), key_ref_from_row(&row)?);
    }

    // Removing on first use drops repeated ids
    Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
}

pub(crate) fn key_ref_from_row(row: &AnyRow) -> Result<KeyRef> {
    Ok(KeyRef {
        row_id: col(row, "id")?,
        key_id: col(row, "key_id")?,
        models: from_json(&col::<String>(row, "models")?, "models")?,
    })
}
