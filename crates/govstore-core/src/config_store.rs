//! Change notification types shared by the store and the live gateway
//!
//! The store publishes a `ConfigChange` after every committed write so the
//! gateway can hot-swap its in-memory state. ClientConfig updates additionally
//! go through a `ConfigReloadHook`, which receives the new value.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::model::ClientConfig;

/// Type alias for configuration change streams
pub type ConfigChangeStream<'a> = BoxStream<'a, ConfigChange>;

/// Configuration domain touched by a committed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigDomain {
    ClientConfig,
    Providers,
    McpClients,
    EnvKeys,
    VectorStore,
    LogStore,
    Governance,
    Plugins,
    ConfigEntries,
    ModelPricing,
    Backend,
}

/// Configuration change notification
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// Domain that changed
    pub domain: ConfigDomain,

    /// Timestamp of the commit
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Monotonic store-wide version, incremented per published change
    pub version: u64,
}

/// Called after a ClientConfig update commits.
///
/// Implementations must not fail the write: the new configuration is already
/// durable when the hook runs.
#[async_trait]
pub trait ConfigReloadHook: Send + Sync {
    async fn client_config_changed(&self, config: &ClientConfig);
}

/// Backend migration state machine
///
/// `Idle → MigrationRequested → Transferring → Verifying → Swapped`, or
/// `MigrationRequested | Transferring | Verifying → Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    MigrationRequested,
    Transferring,
    Verifying,
    Swapped,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Swapped | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Idle, MigrationRequested)
                | (Swapped, MigrationRequested)
                | (Failed, MigrationRequested)
                | (MigrationRequested, Transferring)
                | (Transferring, Verifying)
                | (Verifying, Swapped)
                | (MigrationRequested, Failed)
                | (Transferring, Failed)
                | (Verifying, Failed)
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::MigrationRequested => "requesting migration",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Swapped => "swapped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
