//! Live backend migration
//!
//! Copies the whole store to another backend with a [`BulkTransfer`], opens
//! and verifies the copy, then swaps the active backend pointer. Writes pause
//! for the duration (the mutation gate is held exclusively); reads keep being
//! served by the old backend until the swap.
//!
//! [`BulkTransfer`]: crate::transfer::BulkTransfer

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use govstore_core::config_store::{ConfigDomain, MigrationState};
use govstore_core::model::BackendConfig;
use govstore_core::redaction::ensure_resolved;
use govstore_core::settings::write_backend_descriptor;
use govstore_core::{Error, Redact, Result};

use crate::backend::Backend;
use crate::error::DbResultExt;
use crate::repair::RepairReport;
use crate::repository::stores;
use crate::store::ConfigStore;

/// Outcome of [`ConfigStore::begin_backend_migration`]
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// `Swapped`, or `Idle` when the target already was the active backend
    pub state: MigrationState,
    pub source: String,
    pub destination: String,
    /// Startup repair run on the destination, if it was opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairReport>,
    pub elapsed_ms: u64,
}

impl ConfigStore {
    /// Move the store to `target`.
    ///
    /// Redacted secrets in `target` are restored from the active descriptor.
    /// Returns `Conflict` while another migration runs and
    /// `Error::Migration` when a stage fails, in which case the active
    /// backend is unchanged. Data already copied to the destination by a
    /// failed run is left where it is.
    pub async fn begin_backend_migration(&self, target: BackendConfig) -> Result<MigrationReport> {
        let started = Instant::now();
        let current = self.active();
        let target = target.merge_secrets(current.config());
        ensure_resolved(&target, "Backend descriptor")?;
        target.validate()?;

        if &target == current.config() {
            info!("{} is already the active backend", target.describe());
            return Ok(MigrationReport {
                state: MigrationState::Idle,
                source: current.config().describe(),
                destination: target.describe(),
                repair: None,
                elapsed_ms: 0,
            });
        }
        drop(current);

        let _migration = self.inner.migration_lock.try_lock().map_err(|_| {
            Error::Conflict("A backend migration is already in progress".to_string())
        })?;
        self.advance(MigrationState::MigrationRequested);

        // Waits for in-flight transactions, then holds new ones back
        let _writes = self.inner.gate.write().await;
        let source = self.active();
        info!(
            "Migrating config store: {} -> {}",
            source.config().describe(),
            target.describe()
        );

        self.advance(MigrationState::Transferring);
        let limit = self.inner.settings.transfer.timeout();
        match tokio::time::timeout(limit, self.inner.transfer.transfer(source.config(), &target)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(MigrationState::Transferring, e.to_string())),
            Err(_) => {
                return Err(self.fail(
                    MigrationState::Transferring,
                    format!("transfer did not finish within {}s", limit.as_secs()),
                ));
            }
        }

        self.advance(MigrationState::Verifying);
        let (destination, repair) = match Backend::open(target.clone(), &self.inner.pool_config).await {
            Ok(opened) => opened,
            Err(e) => return Err(self.fail(MigrationState::Verifying, e.to_string())),
        };
        if let Err(e) = self.record_descriptor(&destination).await {
            destination.close().await;
            return Err(self.fail(MigrationState::Verifying, e.to_string()));
        }

        *self.inner.active.write() = Arc::new(destination);
        self.advance(MigrationState::Swapped);
        self.inner.notifier.publish(ConfigDomain::Backend);

        let report = MigrationReport {
            state: MigrationState::Swapped,
            source: source.config().describe(),
            destination: target.describe(),
            repair: Some(repair),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Config store now on {} ({}ms)",
            report.destination, report.elapsed_ms
        );
        Ok(report)
    }

    /// Persist the new descriptor in the destination itself and, when
    /// configured, in the descriptor file read at the next start.
    async fn record_descriptor(&self, destination: &Backend) -> Result<()> {
        let mut tx = destination.begin().await?;
        stores::replace_backend_descriptor(&mut tx, destination.config()).await?;
        tx.commit()
            .await
            .db_context("Failed to commit backend descriptor")?;

        if let Some(path) = &self.inner.settings.descriptor_path {
            write_backend_descriptor(path, destination.config())?;
        }
        Ok(())
    }

    fn advance(&self, next: MigrationState) {
        let mut state = self.inner.migration_state.lock();
        if !state.can_transition_to(next) {
            error!("Unexpected migration transition {} -> {}", *state, next);
        }
        *state = next;
    }

    fn fail(&self, stage: MigrationState, message: String) -> Error {
        error!("Backend migration failed while {}: {}", stage, message);
        self.advance(MigrationState::Failed);
        Error::Migration { stage, message }
    }
}
