//! Error types for GovStore

use std::time::Duration;

use thiserror::Error;

use crate::config_store::MigrationState;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested entity does not exist. Recoverable: callers may create it.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An invariant would be violated (duplicate natural key, orphaned budget, ...)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    /// I/O or transaction failure reported by the storage engine
    #[error("Storage error: {0}")]
    Storage(String),

    /// Backend migration aborted; the active backend is unchanged
    #[error("Backend migration failed while {stage}: {message}")]
    Migration {
        stage: MigrationState,
        message: String,
    },

    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
