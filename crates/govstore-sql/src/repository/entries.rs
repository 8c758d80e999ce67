use sqlx::AnyConnection;

use govstore_core::model::ConfigEntry;
use govstore_core::{Error, Result};

use super::{col, now};
use crate::error::DbResultExt;

pub async fn get(conn: &mut AnyConnection, key: &str) -> Result<ConfigEntry> {
    let row = sqlx::query("SELECT entry_key, value FROM config_entries WHERE entry_key = $1")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .db_context(&format!("Failed to query config entry {}", key))?
        .ok_or_else(|| Error::not_found("config entry", key))?;

    Ok(ConfigEntry {
        key: col(&row, "entry_key")?,
        value: col(&row, "value")?,
    })
}

/// Insert or overwrite the entry stored under `entry.key`
pub async fn upsert(conn: &mut AnyConnection, entry: &ConfigEntry) -> Result<()> {
    let stamp = now();
    let updated = sqlx::query("UPDATE config_entries SET value = $1, updated_at = $2 WHERE entry_key = $3")
        .bind(&entry.value)
        .bind(&stamp)
        .bind(&entry.key)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to update config entry {}", entry.key))?
        .rows_affected();

    if updated == 0 {
        sqlx::query("INSERT INTO config_entries (entry_key, value, updated_at) VALUES ($1, $2, $3)")
            .bind(&entry.key)
            .bind(&entry.value)
            .bind(&stamp)
            .execute(&mut *conn)
            .await
            .db_context(&format!("Failed to insert config entry {}", entry.key))?;
    }
    Ok(())
}
