//! An opened backend: driver pool plus the dialect it speaks

use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Transaction};
use tracing::info;

use govstore_core::model::BackendConfig;
use govstore_core::{Result, StoreSettings};

use crate::dialect::Dialect;
use crate::error::DbResultExt;
use crate::repair::{RepairReport, run_repair};
use crate::schema::reconcile;

/// Connection pool settings
///
/// # Example
/// ```
/// use govstore_sql::PoolConfig;
///
/// let config = PoolConfig::default()
///     .with_max_connections(10)
///     .with_min_connections(2);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,

    /// How long a connection can remain idle before being closed
    pub idle_timeout: Duration,

    pub max_lifetime: Duration,

    /// How long a SQLite statement waits on another connection's lock
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_min_connections(mut self, min_connections: u32) -> Self {
        self.min_connections = min_connections;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl From<&StoreSettings> for PoolConfig {
    fn from(settings: &StoreSettings) -> Self {
        Self::default()
            .with_max_connections(settings.max_connections)
            .with_min_connections(settings.min_connections)
            .with_acquire_timeout(settings.acquire_timeout())
            .with_busy_timeout(settings.acquire_timeout())
    }
}

/// A live, repaired and schema-reconciled backend
#[derive(Debug)]
pub struct Backend {
    config: BackendConfig,
    dialect: Dialect,
    pool: AnyPool,
}

impl Backend {
    /// Connect, run startup repair, then reconcile the schema.
    ///
    /// A repair or reconciliation failure fails the open: the store cannot
    /// vouch for its invariants on a half-repaired database.
    pub async fn open(config: BackendConfig, pool: &PoolConfig) -> Result<(Self, RepairReport)> {
        config.validate()?;
        sqlx::any::install_default_drivers();

        if let BackendConfig::Sqlite { path } = &config
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dialect = Dialect::from(config.kind());
        let pragmas = dialect.connection_pragmas(pool.busy_timeout);
        let pool = AnyPoolOptions::new()
            .max_connections(pool.max_connections)
            .min_connections(pool.min_connections)
            .acquire_timeout(pool.acquire_timeout)
            .idle_timeout(Some(pool.idle_timeout))
            .max_lifetime(Some(pool.max_lifetime))
            .after_connect(move |conn, _meta| {
                let pragmas = pragmas.clone();
                Box::pin(async move {
                    for pragma in &pragmas {
                        sqlx::query(pragma.as_str()).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(&config.connection_url())
            .await
            .db_context(&format!("Failed to connect to {}", config.describe()))?;

        let backend = Self {
            dialect,
            config,
            pool,
        };
        let report = backend.prepare().await?;

        info!("Opened {}", backend.config.describe());
        Ok((backend, report))
    }

    async fn prepare(&self) -> Result<RepairReport> {
        let mut tx = self.begin().await?;
        let report = run_repair(&mut tx, self.dialect).await?;
        reconcile(&mut tx, self.dialect).await?;
        tx.commit()
            .await
            .db_context("Failed to commit schema transaction")?;
        Ok(report)
    }

    /// Open a write transaction in this backend's dialect
    pub async fn begin(&self) -> Result<Transaction<'static, Any>> {
        self.pool
            .begin_with(self.dialect.begin_sql())
            .await
            .db_context(&format!("Failed to begin transaction on {}", self.config.describe()))
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_pool_config_from_settings() {
        let settings = StoreSettings {
            max_connections: 12,
            min_connections: 3,
            acquire_timeout_secs: 9,
            ..Default::default()
        };
        let config = PoolConfig::from(&settings);
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.min_connections, 3);
        assert_eq!(config.acquire_timeout, Duration::from_secs(9));

        // Other values should remain at defaults
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    }
}
