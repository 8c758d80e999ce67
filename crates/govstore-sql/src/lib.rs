//! SQL-backed governance configuration store (SQLite and PostgreSQL)
//!
//! Opens one of the two relational backends through sqlx's `Any` driver,
//! repairs legacy key rows, reconciles the schema, and serves every
//! configuration domain through [`ConfigStore`].
//!
//! # Features
//! - Caller-composable transactions via [`StoreTx`]
//! - Secret redaction on read and secret restoration on write
//! - Change notification stream and client-config reload hook
//! - Live migration between backends through a pluggable [`BulkTransfer`]
//!
//! # Example
//! ```no_run
//! # use govstore_sql::ConfigStore;
//! # use govstore_core::StoreSettings;
//! # use govstore_core::model::BackendConfig;
//! # async fn example() -> govstore_core::Result<()> {
//! let settings = StoreSettings::new(BackendConfig::sqlite("/var/lib/govstore/config.db"));
//! let store = ConfigStore::open(settings).await?;
//!
//! let mut tx = store.begin_transaction().await?;
//! store.delete_plugin(Some(&mut tx), "semantic-cache").await?;
//! store.delete_model_prices(Some(&mut tx)).await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod dialect;
mod error;
mod migration;
mod notify;
pub mod repair;
mod repository;
pub mod schema;
mod store;
mod transfer;
mod tx;

pub use backend::{Backend, PoolConfig};
pub use error::DbResultExt;
pub use migration::MigrationReport;
pub use repair::RepairReport;
pub use store::ConfigStore;
pub use transfer::{BulkTransfer, CommandTransfer};
pub use tx::StoreTx;
