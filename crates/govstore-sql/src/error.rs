//! Driver error mapping

use govstore_core::Error;

/// Attach a context message to a driver error.
///
/// Unique-constraint violations become `Conflict`; everything else is a
/// `Storage` failure.
pub trait DbResultExt<T> {
    fn db_context(self, context: &str) -> Result<T, Error>;
}

impl<T> DbResultExt<T> for Result<T, sqlx::Error> {
    fn db_context(self, context: &str) -> Result<T, Error> {
        self.map_err(|e| map_db_error(e, context))
    }
}

pub(crate) fn map_db_error(error: sqlx::Error, context: &str) -> Error {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("{}: {}", context, db.message()))
        }
        _ => Error::Storage(format!("{}: {}", context, error)),
    }
}

/// Decode a JSON text column
pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T, Error> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Storage(format!("Corrupt JSON in column {}: {}", column, e)))
}

pub(crate) fn from_json_opt<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    column: &str,
) -> Result<Option<T>, Error> {
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(raw) => from_json(raw, column).map(Some),
    }
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn to_json_opt<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, Error> {
    value.map(to_json).transpose()
}
