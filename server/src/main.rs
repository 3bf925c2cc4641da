mod config;
mod setup;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use setup::{ensure_database_directory_from_config, initialize_app, spawn_background_loops};
use telemetry::{init_telemetry, log_config_validation, log_startup_info};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "taskbroker")]
#[command(about = "Multi-agent task broker daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Start the broker daemon
    #[arg(long)]
    start: bool,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Database URL override
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Stale-lease threshold override, in hours
    #[arg(long, env = "TASK_TIMEOUT_HOURS")]
    task_timeout_hours: Option<i64>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => Config::from_file(config_file)?,
        None => Config::from_env()?,
    };

    if let Some(ref database_url) = cli.database_url {
        config.database.url = Some(database_url.clone());
    }
    if let Some(hours) = cli.task_timeout_hours {
        config.lease.timeout_hours = hours;
    }
    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    if !cli.start {
        println!("Task broker daemon");
        println!();
        println!("Usage:");
        println!("  taskbroker --start --database-url sqlite:///var/lib/taskbroker/broker.sqlite");
        println!();
        println!("This will:");
        println!("  - open (or create) the SQLite store and run migrations");
        println!("  - start the stale-lease reclaimer and recurrence materializer");
        println!("  - host the broker facade for attached transports");
        println!();
        println!("For more options, use: taskbroker --help");
        return Ok(());
    }

    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;
    log_config_validation(&config);
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }
    log_startup_info(&config);

    ensure_database_directory_from_config(&config)
        .context("Failed to create database directory")?;

    let app = initialize_app(&config)
        .await
        .context("Failed to initialize application")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loops = spawn_background_loops(app.store.clone(), &config, shutdown_rx);

    info!("task broker is ready");
    println!("Task broker is ready");
    println!("  database: {}", config.database_url());
    println!(
        "  stale threshold: {}h, reclaimer every {}s, recurrences every {}s",
        config.lease.timeout_hours,
        config.lease.reclaimer_period_seconds,
        config.lease.recurrence_period_seconds
    );
    println!();
    println!("Press Ctrl+C to shut down");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping control loops");
    let _ = shutdown_tx.send(true);

    for handle in loops {
        if let Err(join_error) = handle.await {
            error!(%join_error, "background loop terminated abnormally");
        }
    }

    println!("Task broker shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
