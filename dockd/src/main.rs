//! `dockd`: builds a storage dock from its YAML config and runs operator
//! commands against the configured backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use libdock::config::DockConfig;
use libdock::{Dock, registry};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "/etc/opensds/dock.yaml";

#[derive(Parser, Debug)]
#[command(name = "dockd", version, about = "Storage dock")]
struct Cli {
    /// Dock configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered backend types and their capabilities
    Drivers,
    /// List the pools a backend exposes
    Pools {
        #[arg(short, long)]
        backend: String,
    },
    /// Collect one round of metrics, or list the supported ones
    Metrics {
        #[arg(short, long)]
        backend: String,
        /// Only list the metrics offered for this resource type
        #[arg(long)]
        resource_type: Option<String>,
    },
}

#[derive(Serialize)]
struct DriverEntry {
    name: String,
    kinds: Vec<String>,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn load_config(path: &Path) -> Result<DockConfig> {
    let exists = tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if !exists {
        warn!(path = %path.display(), "dock config not found, using defaults");
        return Ok(DockConfig::default());
    }
    DockConfig::load(path)
        .await
        .with_context(|| format!("failed to load dock config {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(dock: &Dock, command: Command) -> Result<()> {
    match command {
        Command::Drivers => {
            let drivers = registry::drivers();
            let mut entries = Vec::new();
            for name in drivers.names() {
                let driver = drivers
                    .create(&name)
                    .with_context(|| format!("failed to construct driver {name}"))?;
                let kinds = driver
                    .kinds()
                    .iter()
                    .map(|k| format!("{k:?}").to_lowercase())
                    .collect();
                entries.push(DriverEntry { name, kinds });
            }
            print_json(&entries)
        }
        Command::Pools { backend } => {
            let pools = dock
                .list_pools(&backend)
                .await
                .with_context(|| format!("failed to list pools of {backend}"))?;
            print_json(&pools)
        }
        Command::Metrics {
            backend,
            resource_type: Some(resource_type),
        } => {
            let names = dock
                .get_metric_list(&backend, &resource_type)
                .await
                .with_context(|| format!("failed to list metrics of {backend}"))?;
            print_json(&names)
        }
        Command::Metrics {
            backend,
            resource_type: None,
        } => {
            let metrics = dock
                .collect_metrics(&backend)
                .await
                .with_context(|| format!("failed to collect metrics of {backend}"))?;
            print_json(&metrics)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    libdock::register_all_drivers(&registry::drivers(), &registry::backup_drivers())
        .context("failed to register built-in drivers")?;
    let config = load_config(&cli.config).await?;
    let dock: Arc<Dock> = Arc::new(Dock::new(config, registry::drivers(), registry::backup_drivers()));
    info!(backends = ?dock.backends(), "dock ready");

    let result = run(&dock, cli.command).await;
    if let Err(e) = dock.shutdown().await {
        warn!(error = %e, "dock shutdown reported an error");
    }
    result
}
