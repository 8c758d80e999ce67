use sqlx::AnyConnection;
use tracing::info;

use govstore_core::Result;
use govstore_core::model::{McpClientConfig, McpConnectionType};

use super::{col, now};
use crate::error::{DbResultExt, from_json, from_json_opt, to_json, to_json_opt};

pub async fn get_all(conn: &mut AnyConnection) -> Result<Vec<McpClientConfig>> {
    let rows = sqlx::query(
        "SELECT name, connection_type, connection_string, stdio_config, tools_to_execute, \
         tools_to_skip FROM config_mcp_clients ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await
    .db_context("Failed to query MCP clients")?;

    rows.iter()
        .map(|row| {
            Ok(McpClientConfig {
                name: col(row, "name")?,
                connection_type: McpConnectionType::parse(&col::<String>(row, "connection_type")?)?,
                connection_string: col(row, "connection_string")?,
                stdio_config: from_json_opt(col(row, "stdio_config")?, "stdio_config")?,
                tools_to_execute: from_json(
                    &col::<String>(row, "tools_to_execute")?,
                    "tools_to_execute",
                )?,
                tools_to_skip: from_json(&col::<String>(row, "tools_to_skip")?, "tools_to_skip")?,
            })
        })
        .collect()
}

/// Delete every client, then insert the submitted set
pub async fn replace_all(conn: &mut AnyConnection, clients: &[McpClientConfig]) -> Result<()> {
    sqlx::query("DELETE FROM config_mcp_clients")
        .execute(&mut *conn)
        .await
        .db_context("Failed to clear MCP clients")?;

    let stamp = now();
    for client in clients {
        sqlx::query(
            "INSERT INTO config_mcp_clients (name, connection_type, connection_string, \
             stdio_config, tools_to_execute, tools_to_skip, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(&client.name)
        .bind(client.connection_type.as_str())
        .bind(client.connection_string.as_deref())
        .bind(to_json_opt(client.stdio_config.as_ref())?)
        .bind(to_json(&client.tools_to_execute)?)
        .bind(to_json(&client.tools_to_skip)?)
        .bind(&stamp)
        .execute(&mut *conn)
        .await
        .db_context(&format!("Failed to insert MCP client {}", client.name))?;
    }

    info!("Replaced MCP clients ({} registered)", clients.len());
    Ok(())
}
