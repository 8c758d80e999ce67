//! Transaction-scoped execution context

use std::sync::Arc;

use sqlx::{Any, AnyConnection, Transaction};
use tokio::sync::OwnedRwLockReadGuard;
use tracing::debug;

use govstore_core::Result;
use govstore_core::config_store::ConfigDomain;
use govstore_core::model::{BackendConfig, ClientConfig};

use crate::backend::Backend;
use crate::error::DbResultExt;
use crate::notify::Notifier;
use crate::repository::governance;

/// An open transaction on the active backend.
///
/// Pass it as `Some(&mut tx)` to any mutating `ConfigStore` method to group
/// several writes into one atomic unit. Nothing is visible to other callers
/// until [`StoreTx::commit`]; dropping the value rolls everything back.
///
/// While a `StoreTx` is alive, backend migration waits for it.
pub struct StoreTx {
    tx: Transaction<'static, Any>,
    backend: Arc<Backend>,
    notifier: Arc<Notifier>,
    touched_governance: bool,
    pending: Vec<ConfigDomain>,
    client_config: Option<ClientConfig>,
    // Released last, after the transaction is finished
    _gate: OwnedRwLockReadGuard<()>,
}

impl StoreTx {
    pub(crate) fn new(
        tx: Transaction<'static, Any>,
        backend: Arc<Backend>,
        notifier: Arc<Notifier>,
        gate: OwnedRwLockReadGuard<()>,
    ) -> Self {
        Self {
            tx,
            backend,
            notifier,
            touched_governance: false,
            pending: Vec::new(),
            client_config: None,
            _gate: gate,
        }
    }

    pub(crate) fn conn(&mut self) -> &mut AnyConnection {
        &mut self.tx
    }

    /// Backend this transaction runs on
    pub fn backend(&self) -> &BackendConfig {
        self.backend.config()
    }

    /// Queue a change notification for publication after commit
    pub(crate) fn record(&mut self, domain: ConfigDomain) {
        if domain == ConfigDomain::Governance {
            self.touched_governance = true;
        }
        if !self.pending.contains(&domain) {
            self.pending.push(domain);
        }
    }

    pub(crate) fn record_client_config(&mut self, config: ClientConfig) {
        self.record(ConfigDomain::ClientConfig);
        self.client_config = Some(config);
    }

    /// Verify ownership invariants, commit, then notify.
    ///
    /// A budget or rate limit left without exactly one owner fails the commit
    /// with `Conflict` and rolls the transaction back.
    pub async fn commit(mut self) -> Result<()> {
        if self.touched_governance {
            governance::verify_ownership(&mut self.tx).await?;
        }

        let StoreTx {
            tx,
            notifier,
            pending,
            client_config,
            _gate,
            ..
        } = self;

        tx.commit().await.db_context("Failed to commit transaction")?;
        drop(_gate);
        debug!("Committed transaction ({} domains changed)", pending.len());

        for domain in pending {
            notifier.publish(domain);
        }
        if let Some(config) = client_config {
            notifier.client_config_changed(&config).await;
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .db_context("Failed to roll back transaction")
    }
}
