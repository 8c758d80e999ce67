use sqlx::AnyConnection;
use sqlx::any::AnyRow;
use tracing::debug;

use govstore_core::model::Plugin;
use govstore_core::{Error, Result};

use super::{col, col_bool, flag, now};
use crate::error::{DbResultExt, from_json, to_json};

fn plugin_from_row(row: &AnyRow) -> Result<Plugin> {
    Ok(Plugin {
        name: col(row, "name")?,
        enabled: col_bool(row, "enabled")?,
        config: from_json(&col::<String>(row, "config")?, "config")?,
    })
}

pub async fn get_all(conn: &mut AnyConnection) -> Result<Vec<Plugin>> {
    let rows = sqlx::query("SELECT name, enabled, config FROM config_plugins ORDER BY name")
        .fetch_all(&mut *conn)
        .await
        .db_context("Failed to query plugins")?;
    rows.iter().map(plugin_from_row).collect()
}

pub async fn get(conn: &mut AnyConnection, name: &str) -> Result<Plugin> {
    let row = sqlx::query("SELECT name, enabled, config FROM config_plugins WHERE name = $1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .db_context(&format!("Failed to query plugin {}", name))?
        .ok_or_else(|| Error::not_found("plugin", name))?;
    plugin_from_row(&row)
}

/// A second plugin with the same name is a `Conflict`
pub async fn insert(conn: &mut AnyConnection, plugin: &Plugin) -> Result<()> {
    sqlx::query(
        "INSERT INTO config_plugins (name, enabled, config, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $4)",
    )
    .bind(&plugin.name)
    .bind(flag(plugin.enabled))
    .bind(to_json(&plugin.config)?)
    .bind(now())
    .execute(&mut *conn)
    .await
    .db_context(&format!("Failed to insert plugin {}", plugin.name))?;
    debug!("Created plugin {}", plugin.name);
    Ok(())
}

/// Delete by name, then insert
pub async fn replace(conn: &mut AnyConnection, plugin: &Plugin) -> Result<()> {
    sqlx::query("DELETE FROM config_plugins WHERE name = $1")
        .bind(&plugin.name)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to remove plugin {}", plugin.name))?;
    insert(conn, plugin).await
}

pub async fn delete(conn: &mut AnyConnection, name: &str) -> Result<()> {
    let removed = sqlx::query("DELETE FROM config_plugins WHERE name = $1")
        .bind(name)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to delete plugin {}", name))?
        .rows_affected();
    if removed == 0 {
        return Err(Error::not_found("plugin", name));
    }
    debug!("Deleted plugin {}", name);
    Ok(())
}
