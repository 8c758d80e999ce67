//! Per-engine SQL differences
//!
//! Statements shared by both engines are written once with `$N` placeholders.
//! Only DDL types, catalog introspection and the repair deletes differ.

use std::time::Duration;

use govstore_core::model::BackendKind;

use crate::schema::ColumnType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl From<BackendKind> for Dialect {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Sqlite => Self::Sqlite,
            BackendKind::Postgres => Self::Postgres,
        }
    }
}

impl Dialect {
    /// Statements run on every new pooled connection
    pub fn connection_pragmas(&self, busy_timeout: Duration) -> Vec<String> {
        match self {
            Self::Sqlite => vec![
                "PRAGMA journal_mode = WAL".to_string(),
                "PRAGMA synchronous = NORMAL".to_string(),
                format!("PRAGMA busy_timeout = {}", busy_timeout.as_millis()),
            ],
            Self::Postgres => Vec::new(),
        }
    }

    /// Statement that opens a write transaction.
    ///
    /// SQLite takes the write lock up front so that two transactions which
    /// both read before writing queue on the busy timeout instead of failing
    /// with `SQLITE_BUSY` when the second one upgrades.
    pub fn begin_sql(&self) -> &'static str {
        match self {
            Self::Sqlite => "BEGIN IMMEDIATE",
            Self::Postgres => "BEGIN",
        }
    }

    pub fn column_type(&self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (Self::Sqlite, ColumnType::Id) => "INTEGER PRIMARY KEY AUTOINCREMENT",
            (Self::Postgres, ColumnType::Id) => "BIGSERIAL PRIMARY KEY",
            (Self::Sqlite, ColumnType::Integer) => "INTEGER",
            (Self::Postgres, ColumnType::Integer) => "BIGINT",
            (Self::Sqlite, ColumnType::Float) => "REAL",
            (Self::Postgres, ColumnType::Float) => "DOUBLE PRECISION",
            (_, ColumnType::Text) => "TEXT",
        }
    }

    /// One row with a count of matching tables; binds the table name as `$1`
    pub fn table_exists_sql(&self) -> &'static str {
        match self {
            Self::Sqlite => {
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = $1"
            }
            Self::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name::text = $1"
            }
        }
    }

    /// Column names of a table; binds the table name as `$1`
    pub fn columns_sql(&self) -> &'static str {
        match self {
            Self::Sqlite => "SELECT name FROM pragma_table_info($1)",
            Self::Postgres => {
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name::text = $1"
            }
        }
    }

    /// Delete every (key_id, value) duplicate except the lowest row id
    pub fn dedupe_keys_sql(&self) -> &'static str {
        match self {
            Self::Sqlite => {
                "DELETE FROM config_keys WHERE id NOT IN (\
                     SELECT MIN(id) FROM config_keys GROUP BY key_id, value\
                 )"
            }
            Self::Postgres => {
                "DELETE FROM config_keys WHERE id IN (\
                     SELECT id FROM (\
                         SELECT id, ROW_NUMBER() OVER (PARTITION BY key_id, value ORDER BY id) AS rn \
                         FROM config_keys\
                     ) ranked WHERE ranked.rn > 1\
                 )"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_column_per_engine() {
        assert!(Dialect::Sqlite.column_type(ColumnType::Id).contains("AUTOINCREMENT"));
        assert!(Dialect::Postgres.column_type(ColumnType::Id).starts_with("BIGSERIAL"));
    }

    #[test]
    fn test_sqlite_write_transactions_take_the_lock_up_front() {
        assert_eq!(Dialect::Sqlite.begin_sql(), "BEGIN IMMEDIATE");
        assert_eq!(Dialect::Postgres.begin_sql(), "BEGIN");

        let pragmas = Dialect::Sqlite.connection_pragmas(Duration::from_millis(2500));
        assert!(pragmas.contains(&"PRAGMA journal_mode = WAL".to_string()));
        assert!(pragmas.contains(&"PRAGMA busy_timeout = 2500".to_string()));
        assert!(Dialect::Postgres.connection_pragmas(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_dedupe_strategy_per_engine() {
        assert!(Dialect::Sqlite.dedupe_keys_sql().contains("MIN(id)"));
        assert!(Dialect::Postgres.dedupe_keys_sql().contains("ROW_NUMBER()"));
    }
}
