use crate::config::Config;
use anyhow::{Context, Result};
use broker_core::store::TaskStore;
use broker_db::SqliteStore;
use broker_protocol::{
    Broker, LeaseReclaimer, MaterializerConfig, ReclaimerConfig, RecurrenceMaterializer,
    TenantGuard,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Everything a transport needs to mount the broker.
pub struct App {
    pub store: Arc<SqliteStore>,
    pub broker: Broker<SqliteStore>,
    pub guard: TenantGuard<SqliteStore>,
}

/// Connect the store, run migrations, and build the facade.
pub async fn initialize_app(config: &Config) -> Result<App> {
    let store = SqliteStore::new(&config.database_url())
        .await
        .context("Failed to connect to the database")?;
    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;
    store
        .health_check()
        .await
        .context("Database health check failed")?;

    let store = Arc::new(store);
    info!("store initialized");

    Ok(App {
        broker: Broker::new(store.clone()),
        guard: TenantGuard::new(store.clone()),
        store,
    })
}

/// Spawn the two control loops; they stop when the shutdown signal flips.
pub fn spawn_background_loops(
    store: Arc<SqliteStore>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let reclaimer = LeaseReclaimer::new(
        store.clone(),
        ReclaimerConfig {
            timeout_hours: config.lease.timeout_hours,
            period: Duration::from_secs(config.lease.reclaimer_period_seconds),
            batch_limit: 100,
        },
    );
    let materializer = RecurrenceMaterializer::new(
        store,
        MaterializerConfig {
            period: Duration::from_secs(config.lease.recurrence_period_seconds),
            batch_limit: 100,
        },
    );

    vec![
        tokio::spawn(reclaimer.run(shutdown.clone())),
        tokio::spawn(materializer.run(shutdown)),
    ]
}

/// Create the parent directory of a file-backed database if needed.
pub fn ensure_database_directory_from_config(config: &Config) -> Result<()> {
    let url = config.database_url();
    if url.contains(":memory:") {
        return Ok(());
    }
    let path = url.trim_start_matches("sqlite://");
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {parent:?}"))?;
            info!(directory = %parent.display(), "created database directory");
        }
    }
    Ok(())
}
