//! `ConfigStore`: the transactional facade over the active backend
//!
//! Every mutating method takes `Option<&mut StoreTx>`. With `None` the call
//! opens, commits and time-bounds its own transaction; with `Some` it joins
//! the caller's transaction and nothing is visible until the caller commits.
//!
//! Reads of secret-bearing domains return redacted values. The `*_unredacted`
//! variants exist for the live gateway, which needs the plaintext.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sqlx::AnyConnection;
use tracing::{debug, info};

use govstore_core::config_store::{ConfigChangeStream, ConfigDomain, ConfigReloadHook, MigrationState};
use govstore_core::model::{
    BackendConfig, Budget, ClientConfig, ConfigEntry, Customer, CustomerRecord, EnvKeyBindingSet,
    Expand, KeyRef, LogStoreConfig, McpClientConfig, ModelPricing, Plugin, ProviderConfig,
    ProviderSet, RateLimit, Team, TeamRecord, VectorStoreConfig, VirtualKey, VirtualKeyRecord,
    validate_env_keys, validate_mcp_clients, validate_provider_set,
};
use govstore_core::redaction::ensure_resolved;
use govstore_core::settings::read_backend_descriptor;
use govstore_core::{Error, Redact, Result, StoreSettings};

use crate::backend::{Backend, PoolConfig};
use crate::error::DbResultExt;
use crate::notify::Notifier;
use crate::repair::RepairReport;
use crate::repository as repo;
use crate::transfer::{BulkTransfer, CommandTransfer};
use crate::tx::StoreTx;

/// Run `$body` against `$tx` when given, otherwise inside an owned,
/// time-bounded transaction that commits on success.
macro_rules! in_transaction {
    ($store:expr, $tx:expr, |$stx:ident| $body:block) => {{
        match $tx {
            Some($stx) => $body,
            None => {
                let timeout = $store.operation_timeout;
                let work = async {
                    let mut owned = $store.begin_transaction().await?;
                    let value: Result<_> = {
                        let $stx = &mut owned;
                        $body
                    };
                    let value = value?;
                    owned.commit().await?;
                    Ok::<_, Error>(value)
                };
                tokio::time::timeout(timeout, work)
                    .await
                    .unwrap_or_else(|_| Err(Error::Timeout(timeout)))
            }
        }
    }};
}

/// Run a read on a pooled connection of the active backend.
macro_rules! read {
    ($store:expr, |$conn:ident| $body:expr) => {{
        let timeout = $store.operation_timeout;
        let work = async {
            let backend = $store.active();
            let mut pooled = backend
                .pool()
                .acquire()
                .await
                .db_context("Failed to acquire connection")?;
            let $conn: &mut AnyConnection = &mut pooled;
            $body.await
        };
        tokio::time::timeout(timeout, work)
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(timeout)))
    }};
}

pub(crate) struct StoreInner {
    pub(crate) active: RwLock<Arc<Backend>>,
    /// Shared by transactions, exclusive for a backend migration
    pub(crate) gate: Arc<tokio::sync::RwLock<()>>,
    pub(crate) migration_lock: tokio::sync::Mutex<()>,
    pub(crate) migration_state: Mutex<MigrationState>,
    pub(crate) settings: StoreSettings,
    pub(crate) pool_config: PoolConfig,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) transfer: Arc<dyn BulkTransfer>,
    repair_report: RepairReport,
}

/// Handle to the governance configuration store. Cheap to clone.
#[derive(Clone)]
pub struct ConfigStore {
    pub(crate) inner: Arc<StoreInner>,
    operation_timeout: Duration,
}

impl ConfigStore {
    /// Open the configured backend, using the configured external program
    /// for backend migrations.
    pub async fn open(settings: StoreSettings) -> Result<Self> {
        let transfer = Arc::new(CommandTransfer::new(settings.transfer.program.clone()));
        Self::open_with_transfer(settings, transfer).await
    }

    /// Open with a caller-supplied bulk transfer implementation.
    ///
    /// When `descriptor_path` points at an existing file, the backend recorded
    /// there by a previous migration wins over `settings.backend`.
    pub async fn open_with_transfer(
        mut settings: StoreSettings,
        transfer: Arc<dyn BulkTransfer>,
    ) -> Result<Self> {
        settings.validate()?;

        if let Some(path) = &settings.descriptor_path
            && path.exists()
        {
            let recorded = read_backend_descriptor(path)?;
            info!(
                "Using backend recorded in {}: {}",
                path.display(),
                recorded.describe()
            );
            settings.backend = recorded;
        }

        let pool_config = PoolConfig::from(&settings);
        let (backend, repair_report) = Backend::open(settings.backend.clone(), &pool_config).await?;
        if !repair_report.is_noop() {
            info!(
                "Startup repair removed {} null and {} duplicate key rows",
                repair_report.null_rows_removed, repair_report.duplicate_rows_removed
            );
        }

        let operation_timeout = settings.operation_timeout();
        let inner = StoreInner {
            active: RwLock::new(Arc::new(backend)),
            gate: Arc::new(tokio::sync::RwLock::new(())),
            migration_lock: tokio::sync::Mutex::new(()),
            migration_state: Mutex::new(MigrationState::Idle),
            settings,
            pool_config,
            notifier: Arc::new(Notifier::new()),
            transfer,
            repair_report,
        };

        Ok(Self {
            inner: Arc::new(inner),
            operation_timeout,
        })
    }

    /// Handle sharing this store but bounding owned transactions by `timeout`
    pub fn with_operation_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            operation_timeout: timeout,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    /// What startup repair did when this store was opened
    pub fn repair_report(&self) -> &RepairReport {
        &self.inner.repair_report
    }

    pub(crate) fn active(&self) -> Arc<Backend> {
        self.inner.active.read().clone()
    }

    /// Descriptor of the backend currently serving requests, redacted
    pub fn active_backend(&self) -> BackendConfig {
        self.active().config().redacted()
    }

    pub fn migration_state(&self) -> MigrationState {
        *self.inner.migration_state.lock()
    }

    /// Descriptor the active backend recorded about itself when a migration
    /// moved the store there, redacted. `None` for a backend never migrated to.
    pub async fn get_recorded_backend(&self) -> Result<Option<BackendConfig>> {
        read!(self, |conn| repo::stores::get_backend_descriptor(conn))
            .map(|recorded| recorded.map(|config| config.redacted()))
    }

    /// Version of the most recently published change
    pub fn change_version(&self) -> u64 {
        self.inner.notifier.version()
    }

    /// Open a transaction on the active backend.
    ///
    /// Do not call a `None`-transaction method while holding the returned
    /// value: if a backend migration is queued behind it, the inner call
    /// waits for the migration and the migration waits for the outer
    /// transaction.
    pub async fn begin_transaction(&self) -> Result<StoreTx> {
        let gate = Arc::clone(&self.inner.gate).read_owned().await;
        let backend = self.active();
        let tx = backend.begin().await?;
        Ok(StoreTx::new(
            tx,
            backend,
            Arc::clone(&self.inner.notifier),
            gate,
        ))
    }

    /// Stream of committed changes, starting now
    pub fn watch_changes(&self) -> ConfigChangeStream<'static> {
        self.inner.notifier.subscribe()
    }

    pub fn set_reload_hook(&self, hook: Arc<dyn ConfigReloadHook>) {
        self.inner.notifier.set_hook(hook);
    }

    pub async fn close(&self) {
        self.active().close().await;
    }

    // Client config

    pub async fn get_client_config(&self) -> Result<Option<ClientConfig>> {
        read!(self, |conn| repo::client::get(conn))
    }

    pub async fn update_client_config(
        &self,
        tx: Option<&mut StoreTx>,
        config: ClientConfig,
    ) -> Result<()> {
        config.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::client::replace(stx.conn(), &config).await?;
            stx.record_client_config(config);
            Ok(())
        })
    }

    // Providers

    pub async fn get_providers(&self) -> Result<ProviderSet> {
        self.get_providers_unredacted()
            .await
            .map(|providers| providers.redacted())
    }

    pub async fn get_providers_unredacted(&self) -> Result<ProviderSet> {
        read!(self, |conn| repo::providers::get_all(conn))
    }

    pub async fn get_provider(&self, name: &str) -> Result<ProviderConfig> {
        read!(self, |conn| repo::providers::get_one(conn, name)).map(|provider| provider.redacted())
    }

    /// Replace the whole provider set.
    ///
    /// Keys are matched by key id: a resubmitted key keeps its row (and the
    /// virtual keys attached to it), a key left out is deleted together with
    /// its attachments. Redacted secrets are restored from the stored set.
    pub async fn update_providers(
        &self,
        tx: Option<&mut StoreTx>,
        providers: ProviderSet,
    ) -> Result<()> {
        validate_provider_set(&providers)?;
        in_transaction!(self, tx, |stx| {
            let previous = repo::providers::get_all(stx.conn()).await?;
            let merged = providers.merge_secrets(&previous);
            ensure_resolved(&merged, "Provider configuration")?;
            repo::providers::replace_all(stx.conn(), &merged).await?;
            stx.record(ConfigDomain::Providers);
            Ok(())
        })
    }

    pub async fn delete_provider(&self, tx: Option<&mut StoreTx>, name: &str) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            repo::providers::delete(stx.conn(), name).await?;
            stx.record(ConfigDomain::Providers);
            Ok(())
        })
    }

    /// Row ids and models of the given keys, in request order
    pub async fn get_keys_by_ids(&self, ids: &[String]) -> Result<Vec<KeyRef>> {
        read!(self, |conn| repo::providers::keys_by_ids(conn, ids))
    }

    // MCP clients

    pub async fn get_mcp_clients(&self) -> Result<Vec<McpClientConfig>> {
        read!(self, |conn| repo::mcp::get_all(conn))
    }

    pub async fn update_mcp_clients(
        &self,
        tx: Option<&mut StoreTx>,
        clients: Vec<McpClientConfig>,
    ) -> Result<()> {
        validate_mcp_clients(&clients)?;
        in_transaction!(self, tx, |stx| {
            repo::mcp::replace_all(stx.conn(), &clients).await?;
            stx.record(ConfigDomain::McpClients);
            Ok(())
        })
    }

    // Env key bindings

    pub async fn get_env_keys(&self) -> Result<EnvKeyBindingSet> {
        read!(self, |conn| repo::env_keys::get_all(conn))
    }

    pub async fn update_env_keys(
        &self,
        tx: Option<&mut StoreTx>,
        bindings: EnvKeyBindingSet,
    ) -> Result<()> {
        validate_env_keys(&bindings)?;
        in_transaction!(self, tx, |stx| {
            repo::env_keys::replace_all(stx.conn(), &bindings).await?;
            stx.record(ConfigDomain::EnvKeys);
            Ok(())
        })
    }

    // Vector and log stores

    pub async fn get_vector_store_config(&self) -> Result<Option<VectorStoreConfig>> {
        self.get_vector_store_config_unredacted()
            .await
            .map(|config| config.map(|config| config.redacted()))
    }

    pub async fn get_vector_store_config_unredacted(&self) -> Result<Option<VectorStoreConfig>> {
        read!(self, |conn| repo::stores::get_vector_store(conn))
    }

    pub async fn update_vector_store_config(
        &self,
        tx: Option<&mut StoreTx>,
        config: VectorStoreConfig,
    ) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            let merged = match repo::stores::get_vector_store(stx.conn()).await? {
                Some(previous) => config.merge_secrets(&previous),
                None => config,
            };
            ensure_resolved(&merged, "Vector store configuration")?;
            repo::stores::replace_vector_store(stx.conn(), &merged).await?;
            stx.record(ConfigDomain::VectorStore);
            Ok(())
        })
    }

    pub async fn get_log_store_config(&self) -> Result<Option<LogStoreConfig>> {
        self.get_log_store_config_unredacted()
            .await
            .map(|config| config.map(|config| config.redacted()))
    }

    pub async fn get_log_store_config_unredacted(&self) -> Result<Option<LogStoreConfig>> {
        read!(self, |conn| repo::stores::get_log_store(conn))
    }

    pub async fn update_log_store_config(
        &self,
        tx: Option<&mut StoreTx>,
        config: LogStoreConfig,
    ) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            let merged = match repo::stores::get_log_store(stx.conn()).await? {
                Some(previous) => config.merge_secrets(&previous),
                None => config,
            };
            ensure_resolved(&merged, "Log store configuration")?;
            repo::stores::replace_log_store(stx.conn(), &merged).await?;
            stx.record(ConfigDomain::LogStore);
            Ok(())
        })
    }

    // Virtual keys

    pub async fn get_virtual_keys(&self, expand: Expand) -> Result<Vec<VirtualKeyRecord>> {
        read!(self, |conn| repo::governance::get_virtual_keys(conn, expand))
    }

    pub async fn get_virtual_key(&self, id: &str, expand: Expand) -> Result<VirtualKeyRecord> {
        read!(self, |conn| repo::governance::get_virtual_key(conn, id, expand))
    }

    /// Insert a virtual key and attach every key in `key_ids`.
    ///
    /// A budget or rate limit it references must exist already; create both
    /// in the same transaction so the ownership check at commit passes.
    pub async fn create_virtual_key(
        &self,
        tx: Option<&mut StoreTx>,
        virtual_key: VirtualKey,
    ) -> Result<()> {
        virtual_key.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::insert_virtual_key(stx.conn(), &virtual_key).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn update_virtual_key(
        &self,
        tx: Option<&mut StoreTx>,
        virtual_key: VirtualKey,
    ) -> Result<()> {
        virtual_key.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::update_virtual_key(stx.conn(), &virtual_key).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn delete_virtual_key(&self, tx: Option<&mut StoreTx>, id: &str) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            repo::governance::delete_virtual_key(stx.conn(), id).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    // Teams

    pub async fn get_teams(
        &self,
        customer_filter: Option<&str>,
        expand: Expand,
    ) -> Result<Vec<TeamRecord>> {
        read!(self, |conn| repo::governance::get_teams(conn, customer_filter, expand))
    }

    pub async fn get_team(&self, id: &str, expand: Expand) -> Result<TeamRecord> {
        read!(self, |conn| repo::governance::get_team(conn, id, expand))
    }

    pub async fn create_team(&self, tx: Option<&mut StoreTx>, team: Team) -> Result<()> {
        team.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::insert_team(stx.conn(), &team).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn update_team(&self, tx: Option<&mut StoreTx>, team: Team) -> Result<()> {
        team.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::update_team(stx.conn(), &team).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn delete_team(&self, tx: Option<&mut StoreTx>, id: &str) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            repo::governance::delete_team(stx.conn(), id).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    // Customers

    pub async fn get_customers(&self, expand: Expand) -> Result<Vec<CustomerRecord>> {
        read!(self, |conn| repo::governance::get_customers(conn, expand))
    }

    pub async fn get_customer(&self, id: &str, expand: Expand) -> Result<CustomerRecord> {
        read!(self, |conn| repo::governance::get_customer(conn, id, expand))
    }

    pub async fn create_customer(&self, tx: Option<&mut StoreTx>, customer: Customer) -> Result<()> {
        customer.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::insert_customer(stx.conn(), &customer).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn update_customer(&self, tx: Option<&mut StoreTx>, customer: Customer) -> Result<()> {
        customer.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::update_customer(stx.conn(), &customer).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn delete_customer(&self, tx: Option<&mut StoreTx>, id: &str) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            repo::governance::delete_customer(stx.conn(), id).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    // Budgets

    pub async fn get_budgets(&self) -> Result<Vec<Budget>> {
        read!(self, |conn| repo::governance::get_budgets(conn))
    }

    pub async fn get_budget(&self, id: &str) -> Result<Budget> {
        read!(self, |conn| repo::governance::get_budget(conn, id))
    }

    /// Insert a budget. It must gain exactly one owner before the
    /// transaction commits, so a standalone call fails with `Conflict`.
    pub async fn create_budget(&self, tx: Option<&mut StoreTx>, budget: Budget) -> Result<()> {
        budget.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::insert_budget(stx.conn(), &budget).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn update_budget(&self, tx: Option<&mut StoreTx>, budget: Budget) -> Result<()> {
        budget.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::update_budget(stx.conn(), &budget).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    /// Update several budgets atomically, typically usage counters
    pub async fn update_budgets(&self, tx: Option<&mut StoreTx>, budgets: Vec<Budget>) -> Result<()> {
        for budget in &budgets {
            budget.validate()?;
        }
        in_transaction!(self, tx, |stx| {
            for budget in &budgets {
                repo::governance::update_budget(stx.conn(), budget).await?;
            }
            debug!("Updated {} budgets", budgets.len());
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn delete_budget(&self, tx: Option<&mut StoreTx>, id: &str) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            repo::governance::delete_budget(stx.conn(), id).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    // Rate limits

    pub async fn get_rate_limit(&self, id: &str) -> Result<RateLimit> {
        read!(self, |conn| repo::governance::get_rate_limit(conn, id))
    }

    pub async fn create_rate_limit(&self, tx: Option<&mut StoreTx>, limit: RateLimit) -> Result<()> {
        limit.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::insert_rate_limit(stx.conn(), &limit).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn update_rate_limit(&self, tx: Option<&mut StoreTx>, limit: RateLimit) -> Result<()> {
        limit.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::governance::update_rate_limit(stx.conn(), &limit).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn update_rate_limits(
        &self,
        tx: Option<&mut StoreTx>,
        limits: Vec<RateLimit>,
    ) -> Result<()> {
        for limit in &limits {
            limit.validate()?;
        }
        in_transaction!(self, tx, |stx| {
            for limit in &limits {
                repo::governance::update_rate_limit(stx.conn(), limit).await?;
            }
            debug!("Updated {} rate limits", limits.len());
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    pub async fn delete_rate_limit(&self, tx: Option<&mut StoreTx>, id: &str) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            repo::governance::delete_rate_limit(stx.conn(), id).await?;
            stx.record(ConfigDomain::Governance);
            Ok(())
        })
    }

    // Plugins

    pub async fn get_plugins(&self) -> Result<Vec<Plugin>> {
        read!(self, |conn| repo::plugins::get_all(conn))
    }

    pub async fn get_plugin(&self, name: &str) -> Result<Plugin> {
        read!(self, |conn| repo::plugins::get(conn, name))
    }

    pub async fn create_plugin(&self, tx: Option<&mut StoreTx>, plugin: Plugin) -> Result<()> {
        plugin.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::plugins::insert(stx.conn(), &plugin).await?;
            stx.record(ConfigDomain::Plugins);
            Ok(())
        })
    }

    /// Replace an existing plugin, `NotFound` if there is none by that name
    pub async fn update_plugin(&self, tx: Option<&mut StoreTx>, plugin: Plugin) -> Result<()> {
        plugin.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::plugins::get(stx.conn(), &plugin.name).await?;
            repo::plugins::replace(stx.conn(), &plugin).await?;
            stx.record(ConfigDomain::Plugins);
            Ok(())
        })
    }

    pub async fn delete_plugin(&self, tx: Option<&mut StoreTx>, name: &str) -> Result<()> {
        in_transaction!(self, tx, |stx| {
            repo::plugins::delete(stx.conn(), name).await?;
            stx.record(ConfigDomain::Plugins);
            Ok(())
        })
    }

    // Config entries

    pub async fn get_config_entry(&self, key: &str) -> Result<ConfigEntry> {
        read!(self, |conn| repo::entries::get(conn, key))
    }

    pub async fn update_config_entry(&self, tx: Option<&mut StoreTx>, entry: ConfigEntry) -> Result<()> {
        if entry.key.trim().is_empty() {
            return Err(Error::Validation("Config entry key cannot be empty".to_string()));
        }
        in_transaction!(self, tx, |stx| {
            repo::entries::upsert(stx.conn(), &entry).await?;
            stx.record(ConfigDomain::ConfigEntries);
            Ok(())
        })
    }

    // Model pricing

    pub async fn get_model_prices(&self) -> Result<Vec<ModelPricing>> {
        read!(self, |conn| repo::pricing::get_all(conn))
    }

    pub async fn create_model_price(
        &self,
        tx: Option<&mut StoreTx>,
        pricing: ModelPricing,
    ) -> Result<()> {
        pricing.validate()?;
        in_transaction!(self, tx, |stx| {
            repo::pricing::insert(stx.conn(), &pricing).await?;
            stx.record(ConfigDomain::ModelPricing);
            Ok(())
        })
    }

    /// Remove every price row, returning how many were deleted
    pub async fn delete_model_prices(&self, tx: Option<&mut StoreTx>) -> Result<u64> {
        in_transaction!(self, tx, |stx| {
            let removed = repo::pricing::delete_all(stx.conn()).await?;
            stx.record(ConfigDomain::ModelPricing);
            Ok(removed)
        })
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("backend", &self.active().config().describe())
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}
