//! migrationd entry point.

use anyhow::Context as _;
use clap::Parser;
use migration_endpoint::EndpointRegistry;
use migrationd::audit::init_logging;
use migrationd::daemon::{phases, MigrationDaemon};
use migrationd::{Context, DaemonConfig, Store};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// VM migration orchestration daemon
#[derive(Parser, Debug)]
#[command(name = "migrationd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Database file, overriding the configuration
    #[arg(short = 'd', long)]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// URL workers use to reach the engine, overriding the configuration
    #[arg(long)]
    worker_endpoint: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("migrationd: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&args.log_level, config.json_logs);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("migrationd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }
    if let Some(endpoint) = &args.worker_endpoint {
        config.worker_endpoint = endpoint.clone();
    }
    config.json_logs |= args.json_logs;
    config.validate()?;
    Ok(config)
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(database = %config.database_path.display(), worker_endpoint = %config.worker_endpoint,
        "Starting migrationd");

    let store = Store::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;

    // Hypervisor client crates register their drivers here.
    let endpoints = EndpointRegistry::new();

    let ctx = Context::new(Arc::new(store), Arc::new(endpoints), config)?;

    let mut daemon = MigrationDaemon::new(CancellationToken::new());
    for phase in phases::all(&ctx) {
        daemon.register_phase(phase);
    }

    let cancel = daemon.cancel_token();
    let handle = tokio::spawn(daemon.run());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    handle.await.context("Daemon task failed")?;
    info!("migrationd stopped");
    Ok(())
}
