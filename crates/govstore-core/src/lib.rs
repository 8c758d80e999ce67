//! GovStore Core Types
//!
//! This crate provides the storage-independent half of the governance
//! configuration store:
//! - Configuration entities and their structural validation
//! - The secret redaction / merge contract
//! - Change notification and migration state types
//! - Store settings loading
//! - Core error types

pub mod config_store;
pub mod error;
pub mod model;
pub mod redaction;
pub mod settings;

pub use error::{Error, Result};
pub use redaction::{REDACTED, Redact};
pub use settings::StoreSettings;
