//! GovStore CLI
//!
//! Operator commands for the governance configuration store

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use govstore_core::StoreSettings;
use govstore_core::model::Expand;
use govstore_core::settings::read_backend_descriptor;
use govstore_sql::ConfigStore;

#[derive(Parser)]
#[command(name = "govstore")]
#[command(about = "GovStore - governance configuration store for the API gateway", long_about = None)]
struct Cli {
    /// Store settings file (YAML or TOML)
    #[arg(long, env = "GOVSTORE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GOVSTORE_LOG_LEVEL")]
    log_level: String,

    /// Log SQL statements
    #[arg(long, default_value = "false")]
    log_sql_queries: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the store, run startup repair and schema reconciliation
    Repair,
    /// Print the redacted contents of one configuration domain
    Show {
        #[arg(value_enum)]
        domain: Domain,
    },
    /// Move the store to another backend
    Migrate {
        /// Backend descriptor (JSON, TOML or YAML)
        #[arg(long)]
        to: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Domain {
    Client,
    Providers,
    McpClients,
    EnvKeys,
    VectorStore,
    LogStore,
    VirtualKeys,
    Teams,
    Customers,
    Budgets,
    Plugins,
    Pricing,
    Backend,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if !cli.log_sql_queries {
        filter = filter.add_directive("sqlx=warn".parse()?);
    }
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut settings = match &cli.settings {
        Some(path) => StoreSettings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => {
            info!("Using default store settings");
            StoreSettings::default()
        }
    };
    settings.merge_env();

    let store = ConfigStore::open(settings)
        .await
        .context("Failed to open config store")?;

    match cli.command {
        Commands::Repair => print_json(store.repair_report())?,
        Commands::Show { domain } => show(&store, domain).await?,
        Commands::Migrate { to } => {
            let target = read_backend_descriptor(&to)
                .with_context(|| format!("Failed to read backend descriptor {}", to.display()))?;
            let report = store.begin_backend_migration(target).await?;
            print_json(&report)?;
        }
    }

    store.close().await;
    Ok(())
}

async fn show(store: &ConfigStore, domain: Domain) -> anyhow::Result<()> {
    match domain {
        Domain::Client => print_json(&store.get_client_config().await?),
        Domain::Providers => print_json(&store.get_providers().await?),
        Domain::McpClients => print_json(&store.get_mcp_clients().await?),
        Domain::EnvKeys => print_json(&store.get_env_keys().await?),
        Domain::VectorStore => print_json(&store.get_vector_store_config().await?),
        Domain::LogStore => print_json(&store.get_log_store_config().await?),
        Domain::VirtualKeys => print_json(&store.get_virtual_keys(Expand::ALL).await?),
        Domain::Teams => print_json(&store.get_teams(None, Expand::ALL).await?),
        Domain::Customers => print_json(&store.get_customers(Expand::ALL).await?),
        Domain::Budgets => print_json(&store.get_budgets().await?),
        Domain::Plugins => print_json(&store.get_plugins().await?),
        Domain::Pricing => print_json(&store.get_model_prices().await?),
        Domain::Backend => print_json(&store.active_backend()),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
