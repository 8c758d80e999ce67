//! Declarative schema and its reconciliation against a live database
//!
//! Each table is described once. Reconciliation creates missing tables and
//! adds missing columns to tables written by an older release; it never drops
//! or retypes anything, so it is safe to run on every start.

use std::collections::HashSet;

use sqlx::AnyConnection;
use tracing::{debug, info};

use govstore_core::Result;

use crate::dialect::Dialect;
use crate::error::DbResultExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Auto-incrementing storage row id
    Id,
    Text,
    Integer,
    Float,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    /// Constraint suffix, e.g. `NOT NULL DEFAULT 0` or a `REFERENCES` clause
    pub constraint: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static str,
    pub unique: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    /// Table constraints appended after the columns
    pub constraints: &'static [&'static str],
    pub indexes: &'static [IndexSpec],
}

const fn col(name: &'static str, ty: ColumnType, constraint: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        ty,
        constraint,
    }
}

const fn index(name: &'static str, columns: &'static str, unique: bool) -> IndexSpec {
    IndexSpec {
        name,
        columns,
        unique,
    }
}

use ColumnType::{Float, Id, Integer, Text};

/// All tables, parents before children
pub const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "config_client",
        columns: &[
            col("id", Id, ""),
            col("drop_excess_requests", Integer, "NOT NULL DEFAULT 0"),
            col("initial_pool_size", Integer, "NOT NULL DEFAULT 300"),
            col("prometheus_labels", Text, "NOT NULL DEFAULT '[]'"),
            col("enable_logging", Integer, "NOT NULL DEFAULT 1"),
            col("enable_governance", Integer, "NOT NULL DEFAULT 1"),
            col("enforce_governance_header", Integer, "NOT NULL DEFAULT 0"),
            col("allow_direct_keys", Integer, "NOT NULL DEFAULT 0"),
            col("allowed_origins", Text, "NOT NULL DEFAULT '[]'"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "config_providers",
        columns: &[
            col("id", Id, ""),
            col("name", Text, "NOT NULL UNIQUE"),
            col("network_config", Text, ""),
            col("concurrency", Text, ""),
            col("proxy_config", Text, ""),
            col("send_back_raw_response", Integer, "NOT NULL DEFAULT 0"),
            col("custom_provider_config", Text, ""),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "config_keys",
        columns: &[
            col("id", Id, ""),
            col("provider", Text, "NOT NULL DEFAULT ''"),
            col("key_id", Text, ""),
            col("value", Text, ""),
            col("models", Text, "NOT NULL DEFAULT '[]'"),
            col("weight", Float, "NOT NULL DEFAULT 1"),
            col("azure_config", Text, ""),
            col("vertex_config", Text, ""),
            col("bedrock_config", Text, ""),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[
            index("idx_config_keys_key_id_value", "key_id, value", true),
            index("idx_config_keys_provider", "provider", false),
        ],
    },
    TableSpec {
        name: "governance_budgets",
        columns: &[
            col("id", Text, "PRIMARY KEY"),
            col("max_limit", Float, "NOT NULL"),
            col("reset_duration", Text, "NOT NULL"),
            col("current_usage", Float, "NOT NULL DEFAULT 0"),
            col("last_reset", Text, "NOT NULL"),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "governance_rate_limits",
        columns: &[
            col("id", Text, "PRIMARY KEY"),
            col("token_max_limit", Integer, ""),
            col("request_max_limit", Integer, ""),
            col("reset_duration", Text, "NOT NULL"),
            col("token_current_usage", Integer, "NOT NULL DEFAULT 0"),
            col("request_current_usage", Integer, "NOT NULL DEFAULT 0"),
            col("last_reset", Text, "NOT NULL"),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "governance_customers",
        columns: &[
            col("id", Text, "PRIMARY KEY"),
            col("name", Text, "NOT NULL"),
            col(
                "budget_id",
                Text,
                "REFERENCES governance_budgets(id) ON DELETE SET NULL",
            ),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "governance_teams",
        columns: &[
            col("id", Text, "PRIMARY KEY"),
            col("name", Text, "NOT NULL"),
            col(
                "customer_id",
                Text,
                "REFERENCES governance_customers(id) ON DELETE SET NULL",
            ),
            col(
                "budget_id",
                Text,
                "REFERENCES governance_budgets(id) ON DELETE SET NULL",
            ),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[index("idx_governance_teams_customer", "customer_id", false)],
    },
    TableSpec {
        name: "governance_virtual_keys",
        columns: &[
            col("id", Text, "PRIMARY KEY"),
            col("name", Text, "NOT NULL"),
            col("description", Text, "NOT NULL DEFAULT ''"),
            col("is_active", Integer, "NOT NULL DEFAULT 1"),
            col("allowed_models", Text, "NOT NULL DEFAULT '[]'"),
            col(
                "team_id",
                Text,
                "REFERENCES governance_teams(id) ON DELETE SET NULL",
            ),
            col(
                "customer_id",
                Text,
                "REFERENCES governance_customers(id) ON DELETE SET NULL",
            ),
            col(
                "budget_id",
                Text,
                "REFERENCES governance_budgets(id) ON DELETE SET NULL",
            ),
            col(
                "rate_limit_id",
                Text,
                "REFERENCES governance_rate_limits(id) ON DELETE SET NULL",
            ),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[
            index("idx_governance_virtual_keys_team", "team_id", false),
            index("idx_governance_virtual_keys_customer", "customer_id", false),
        ],
    },
    TableSpec {
        name: "governance_virtual_key_keys",
        columns: &[
            col(
                "virtual_key_id",
                Text,
                "NOT NULL REFERENCES governance_virtual_keys(id) ON DELETE CASCADE",
            ),
            col(
                "key_row_id",
                Integer,
                "NOT NULL REFERENCES config_keys(id) ON DELETE CASCADE",
            ),
            // Index of the key in the submitted key set
            col("key_position", Integer, "NOT NULL DEFAULT 0"),
        ],
        constraints: &["PRIMARY KEY (virtual_key_id, key_row_id)"],
        indexes: &[index(
            "idx_governance_virtual_key_keys_key",
            "key_row_id",
            false,
        )],
    },
    TableSpec {
        name: "config_mcp_clients",
        columns: &[
            col("id", Id, ""),
            col("name", Text, "NOT NULL UNIQUE"),
            col("connection_type", Text, "NOT NULL"),
            col("connection_string", Text, ""),
            col("stdio_config", Text, ""),
            col("tools_to_execute", Text, "NOT NULL DEFAULT '[]'"),
            col("tools_to_skip", Text, "NOT NULL DEFAULT '[]'"),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "config_plugins",
        columns: &[
            col("id", Id, ""),
            col("name", Text, "NOT NULL UNIQUE"),
            col("enabled", Integer, "NOT NULL DEFAULT 0"),
            col("config", Text, "NOT NULL DEFAULT 'null'"),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "config_env_keys",
        columns: &[
            col("id", Id, ""),
            col("env_var", Text, "NOT NULL"),
            col("provider", Text, "NOT NULL DEFAULT ''"),
            col("key_type", Text, "NOT NULL"),
            col("config_path", Text, "NOT NULL"),
            col("key_id", Text, "NOT NULL DEFAULT ''"),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[index("idx_config_env_keys_env_var", "env_var", false)],
    },
    TableSpec {
        name: "config_vector_store",
        columns: &[
            col("id", Id, ""),
            col("store_type", Text, "NOT NULL"),
            col("enabled", Integer, "NOT NULL DEFAULT 0"),
            col("config", Text, "NOT NULL"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "config_log_store",
        columns: &[
            col("id", Id, ""),
            col("store_type", Text, "NOT NULL"),
            col("enabled", Integer, "NOT NULL DEFAULT 0"),
            col("config", Text, "NOT NULL"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "config_store_backend",
        columns: &[
            col("id", Id, ""),
            col("store_type", Text, "NOT NULL"),
            col("config", Text, "NOT NULL"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "config_entries",
        columns: &[
            col("id", Id, ""),
            col("entry_key", Text, "NOT NULL UNIQUE"),
            col("value", Text, "NOT NULL"),
            col("updated_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[],
    },
    TableSpec {
        name: "governance_model_pricing",
        columns: &[
            col("id", Id, ""),
            col("model", Text, "NOT NULL"),
            col("provider", Text, "NOT NULL"),
            col("input_cost_per_token", Float, "NOT NULL DEFAULT 0"),
            col("output_cost_per_token", Float, "NOT NULL DEFAULT 0"),
            col("mode", Text, "NOT NULL DEFAULT 'chat'"),
            col("created_at", Text, "NOT NULL DEFAULT ''"),
        ],
        constraints: &[],
        indexes: &[index(
            "idx_governance_model_pricing_model",
            "model, provider, mode",
            true,
        )],
    },
];

impl TableSpec {
    pub fn create_sql(&self, dialect: Dialect) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| column_sql(c, dialect))
            .collect();
        parts.extend(self.constraints.iter().map(|c| c.to_string()));
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.name, parts.join(", "))
    }
}

fn column_sql(column: &ColumnSpec, dialect: Dialect) -> String {
    let ty = dialect.column_type(column.ty);
    if column.constraint.is_empty() {
        format!("{} {}", column.name, ty)
    } else {
        format!("{} {} {}", column.name, ty, column.constraint)
    }
}

impl IndexSpec {
    pub fn create_sql(&self, table: &str) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            table,
            self.columns
        )
    }
}

pub async fn table_exists(conn: &mut AnyConnection, dialect: Dialect, table: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(dialect.table_exists_sql())
        .bind(table)
        .fetch_one(&mut *conn)
        .await
        .db_context(&format!("Failed to check for table {}", table))?;
    Ok(count > 0)
}

async fn existing_columns(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> Result<HashSet<String>> {
    let columns: Vec<String> = sqlx::query_scalar(dialect.columns_sql())
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .db_context(&format!("Failed to list columns of {}", table))?;
    Ok(columns.into_iter().collect())
}

/// Bring the database up to the declared schema
pub async fn reconcile(conn: &mut AnyConnection, dialect: Dialect) -> Result<()> {
    for table in TABLES {
        if table_exists(conn, dialect, table.name).await? {
            let existing = existing_columns(conn, dialect, table.name).await?;
            for column in table.columns.iter().filter(|c| !existing.contains(c.name)) {
                info!("Adding column {}.{}", table.name, column.name);
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    table.name,
                    column_sql(column, dialect)
                );
                sqlx::query(&sql).execute(&mut *conn).await.db_context(&format!(
                    "Failed to add column {}.{}",
                    table.name, column.name
                ))?;
            }
        } else {
            info!("Creating table {}", table.name);
            sqlx::query(&table.create_sql(dialect))
                .execute(&mut *conn)
                .await
                .db_context(&format!("Failed to create table {}", table.name))?;
        }

        for idx in table.indexes {
            debug!("Ensuring index {}", idx.name);
            sqlx::query(&idx.create_sql(table.name))
                .execute(&mut *conn)
                .await
                .db_context(&format!("Failed to create index {}", idx.name))?;
        }
    }

    debug!("Schema reconciled ({} tables)", TABLES.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> &'static TableSpec {
        TABLES.iter().find(|t| t.name == name).unwrap()
    }

    #[test]
    fn test_create_sql_uses_dialect_types() {
        let sql = table("config_keys").create_sql(Dialect::Postgres);
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS config_keys ("));
        assert!(sql.contains("id BIGSERIAL PRIMARY KEY"));
        assert!(sql.contains("weight DOUBLE PRECISION NOT NULL DEFAULT 1"));

        let sql = table("config_keys").create_sql(Dialect::Sqlite);
        assert!(sql.contains("id INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("weight REAL"));
    }

    #[test]
    fn test_association_table_constraints() {
        let sql = table("governance_virtual_key_keys").create_sql(Dialect::Sqlite);
        assert!(sql.ends_with("PRIMARY KEY (virtual_key_id, key_row_id))"));
        assert!(sql.contains("REFERENCES config_keys(id) ON DELETE CASCADE"));
    }

    #[test]
    fn test_key_uniqueness_index() {
        let idx = table("config_keys").indexes[0];
        assert_eq!(
            idx.create_sql("config_keys"),
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_config_keys_key_id_value ON config_keys (key_id, value)"
        );
    }

    #[test]
    fn test_parents_declared_before_children() {
        let position = |name: &str| TABLES.iter().position(|t| t.name == name).unwrap();
        assert!(position("governance_budgets") < position("governance_customers"));
        assert!(position("governance_customers") < position("governance_teams"));
        assert!(position("governance_teams") < position("governance_virtual_keys"));
        assert!(position("config_keys") < position("governance_virtual_key_keys"));
    }
}
