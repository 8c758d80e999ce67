//! Configuration entities
//!
//! Plain records plus structural validation. Relationships are expressed by
//! natural-key references (`team_id`, `budget_id`, `key_ids`, ...); the
//! storage layer enforces them.

pub mod client;
pub mod env_keys;
pub mod governance;
pub mod mcp;
pub mod plugin;
pub mod pricing;
pub mod provider;
pub mod stores;

pub use client::{ClientConfig, ConfigEntry};
pub use env_keys::{EnvKeyBinding, EnvKeyBindingSet, EnvKeyType, validate_env_keys};
pub use governance::{
    Budget, BudgetOwner, Customer, CustomerRecord, Expand, RateLimit, Team, TeamRecord,
    VirtualKey, VirtualKeyRecord, parse_reset_duration,
};
pub use mcp::{McpClientConfig, McpConnectionType, StdioConfig, validate_mcp_clients};
pub use plugin::Plugin;
pub use pricing::ModelPricing;
pub use provider::{
    AzureKeyConfig, BedrockKeyConfig, ConcurrencyConfig, Key, KeyRef, NetworkConfig,
    ProviderConfig, ProviderSet, ProxyConfig, ProxyType, VertexKeyConfig, validate_provider_set,
};
pub use stores::{
    BackendConfig, BackendKind, LogStoreBackend, LogStoreConfig, PostgresConnection,
    VectorStoreBackend, VectorStoreConfig,
};
