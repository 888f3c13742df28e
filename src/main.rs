//! dbtier - main entry point.
//!
//! Loads the database configuration, optionally prints the launch-readiness
//! report, then launches the subsystem and runs until interrupted.

use clap::Parser;
use dbtier::config::DatabasesConfig;
use dbtier::subsystem::DatabaseSubsystem;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "dbtier", about = "Multi-engine database queue subsystem")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "DBTIER_CONFIG")]
    config: std::path::PathBuf,

    /// Print the launch-readiness report and exit. The exit code reflects
    /// readiness.
    #[arg(long)]
    check: bool,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let raw = std::fs::read_to_string(&cli.config)
        .map_err(|e| format!("cannot read {}: {e}", cli.config.display()))?;
    let config = DatabasesConfig::from_json(&raw)?;

    if config.databases.is_empty() {
        eprintln!("Error: at least one database must be configured.");
        eprintln!();
        eprintln!("Example configuration:");
        eprintln!(
            "{}",
            serde_json::json!({
                "databases": [
                    {"name": "jobs", "engine": "sqlite", "database": "jobs.db"},
                    {"name": "audit", "engine": "postgresql", "host": "db.local",
                     "username": "svc", "password": "..."}
                ]
            })
        );
        std::process::exit(1);
    }

    let subsystem = DatabaseSubsystem::new(config)?;

    if cli.check {
        let report = subsystem.check_launch_readiness();
        println!("{report}");
        std::process::exit(if report.ready { 0 } else { 1 });
    }

    info!("Starting dbtier v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = subsystem.launch().await {
        error!(error = %e, "Launch failed");
        return Err(e.into());
    }

    for stats in subsystem.stats().await {
        info!(
            database = %stats.database,
            engine = %stats.engine,
            state = %stats.state,
            "Queue running"
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down");
    subsystem.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
