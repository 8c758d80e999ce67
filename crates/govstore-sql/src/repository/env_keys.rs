use sqlx::AnyConnection;
use tracing::info;

use govstore_core::Result;
use govstore_core::model::{EnvKeyBinding, EnvKeyBindingSet, EnvKeyType};

use super::{col, now};
use crate::error::DbResultExt;

pub async fn get_all(conn: &mut AnyConnection) -> Result<EnvKeyBindingSet> {
    let rows = sqlx::query(
        "SELECT env_var, provider, key_type, config_path, key_id FROM config_env_keys ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query env keys")?;

    let mut set = EnvKeyBindingSet::new();
    for row in &rows {
        let binding = EnvKeyBinding {
            env_var: col(row, "env_var")?,
            provider: col(row, "provider")?,
            key_type: EnvKeyType::parse(&col::<String>(row, "key_type")?)?,
            config_path: col(row, "config_path")?,
            key_id: col(row, "key_id")?,
        };
        set.entry(binding.env_var.clone()).or_default().push(binding);
    }
    Ok(set)
}

/// Delete every binding, then insert the submitted set
pub async fn replace_all(conn: &mut AnyConnection, set: &EnvKeyBindingSet) -> Result<()> {
    sqlx::query("DELETE FROM config_env_keys")
        .execute(&mut *conn)
        .await
        .db_context("Failed to clear env keys")?;

    let stamp = now();
    let mut count = 0;
    for binding in set.values().flatten() {
        sqlx::query(
            "INSERT INTO config_env_keys (env_var, provider, key_type, config_path, key_id, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&binding.env_var)
        .bind(&binding.provider)
        .bind(binding.key_type.as_str())
        .bind(&binding.config_path)
        .bind(&binding.key_id)
        .bind(&stamp)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to insert env key {}", binding.env_var))?;
        count += 1;
    }

    info!("Replaced env key bindings ({} bindings)", count);
    Ok(())
}
