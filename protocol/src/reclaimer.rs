//! Stale-lease reclaimer.
//!
//! Periodically releases in-progress tasks whose `updated_at` is older than
//! the timeout, leaving the system `finding` update and `unlocked_stale`
//! history record behind (the store primitive does both atomically per
//! task). A failed or panicking tick is logged and the loop continues.

use broker_core::{error::Result, models::ReclaimedLease, store::TaskStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// A lease idle longer than this is stale.
    pub timeout_hours: i64,
    /// Sweep cadence.
    pub period: Duration,
    /// Maximum leases released per tick.
    pub batch_limit: u32,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            timeout_hours: 24,
            period: Duration::from_secs(60),
            batch_limit: 100,
        }
    }
}

pub struct LeaseReclaimer<S> {
    store: Arc<S>,
    config: ReclaimerConfig,
}

impl<S: TaskStore + 'static> LeaseReclaimer<S> {
    pub fn new(store: Arc<S>, config: ReclaimerConfig) -> Self {
        Self { store, config }
    }

    /// One sweep; exposed separately so callers can reclaim on demand.
    pub async fn tick_once(&self) -> Result<Vec<ReclaimedLease>> {
        self.store
            .reclaim_stale(self.config.timeout_hours, self.config.batch_limit)
            .await
    }

    /// Run until the shutdown signal flips. The current sweep finishes
    /// before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            timeout_hours = self.config.timeout_hours,
            period_secs = self.config.period.as_secs(),
            "lease reclaimer started"
        );
        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so startup is
        // not a sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let store = self.store.clone();
                    let config = self.config.clone();
                    // Spawned so a panic inside the sweep is contained at
                    // the loop boundary.
                    let sweep = tokio::spawn(async move {
                        store.reclaim_stale(config.timeout_hours, config.batch_limit).await
                    })
                    .await;
                    match sweep {
                        Ok(Ok(reclaimed)) if !reclaimed.is_empty() => {
                            info!(count = reclaimed.len(), "reclaimed stale leases");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(error)) => {
                            error!(%error, "lease reclaimer sweep failed");
                        }
                        Err(join_error) => {
                            warn!(%join_error, "lease reclaimer sweep panicked");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("lease reclaimer stopped");
    }
}
