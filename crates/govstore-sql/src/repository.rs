//! Row-level operations per configuration domain
//!
//! Every function takes the connection it runs on; the caller decides the
//! transaction boundary. Nothing here opens or commits a transaction.

pub mod client;
pub mod entries;
pub mod env_keys;
pub mod governance;
pub mod mcp;
pub mod plugins;
pub mod pricing;
pub mod providers;
pub mod stores;

use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{Any, AnyConnection, Decode, Row, Type};

use govstore_core::{Error, Result};

use crate::error::DbResultExt;

/// Read a column, mapping decode failures to `Storage`
pub(crate) fn col<'r, T>(row: &'r AnyRow, name: &str) -> Result<T>
where
    T: Decode<'r, Any> + Type<Any>,
{
    row.try_get(name)
        .db_context(&format!("Failed to read column {}", name))
}

pub(crate) fn col_bool(row: &AnyRow, name: &str) -> Result<bool> {
    Ok(col::<i64>(row, name)? != 0)
}

pub(crate) fn col_timestamp(row: &AnyRow, name: &str) -> Result<DateTime<Utc>> {
    let raw: String = col(row, name)?;
    parse_timestamp(&raw)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp {:?}: {}", raw, e)))
}

pub(crate) fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn now() -> String {
    timestamp(&Utc::now())
}

pub(crate) fn flag(value: bool) -> i64 {
    i64::from(value)
}

/// Count rows of `table` with the given natural id.
///
/// `table` is always one of this crate's constants, never caller input.
pub(crate) async fn count_by_id(conn: &mut AnyConnection, table: &str, id: &str) -> Result<i64> {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE id = $1", table))
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .db_context(&format!("Failed to look up {} in {}", id, table))
}

/// `NotFound` unless a row with this id exists
pub(crate) async fn require_row(
    conn: &mut AnyConnection,
    table: &str,
    entity: &'static str,
    id: &str,
) -> Result<()> {
    if count_by_id(conn, table, id).await? == 0 {
        return Err(Error::not_found(entity, id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        assert_eq!(parse_timestamp(&timestamp(&now)).unwrap(), now);
    }

    #[test]
    fn test_invalid_timestamp_is_storage_error() {
        assert!(matches!(parse_timestamp("yesterday"), Err(Error::Storage(_))));
    }
}
