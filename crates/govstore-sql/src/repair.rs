//! Startup repair of legacy key rows
//!
//! Older databases predate the `(key_id, value)` uniqueness rule and may hold
//! rows with a null key id or value. Repair removes both kinds of row before
//! the unique index is created. It runs on every open and is a no-op on a
//! clean table.

use serde::Serialize;
use sqlx::AnyConnection;
use tracing::{debug, info};

use govstore_core::Result;

use crate::dialect::Dialect;
use crate::error::DbResultExt;
use crate::schema::table_exists;

/// Rows removed by a repair run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// False when the key table did not exist yet
    pub ran: bool,
    pub null_rows_removed: u64,
    pub duplicate_rows_removed: u64,
}

impl RepairReport {
    pub fn is_noop(&self) -> bool {
        self.null_rows_removed == 0 && self.duplicate_rows_removed == 0
    }
}

pub async fn run_repair(conn: &mut AnyConnection, dialect: Dialect) -> Result<RepairReport> {
    if !table_exists(conn, dialect, "config_keys").await? {
        debug!("No config_keys table yet, skipping repair");
        return Ok(RepairReport::default());
    }

    let null_rows_removed =
        sqlx::query("DELETE FROM config_keys WHERE key_id IS NULL OR value IS NULL")
            .execute(&mut *conn)
            .await
            .db_context("Failed to remove key rows with null id or value")?
            .rows_affected();

    let duplicate_rows_removed = sqlx::query(dialect.dedupe_keys_sql())
        .execute(&mut *conn)
        .await
        .db_context("Failed to remove duplicate key rows")?
        .rows_affected();

    let report = RepairReport {
        ran: true,
        null_rows_removed,
        duplicate_rows_removed,
    };

    if report.is_noop() {
        debug!("Key table is clean, repair made no changes");
    } else {
        info!(
            "Repaired key table: removed {} null rows and {} duplicate rows",
            null_rows_removed, duplicate_rows_removed
        );
    }

    Ok(report)
}
