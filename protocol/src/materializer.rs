//! Recurring-task materializer.
//!
//! Each tick materializes at most one occurrence per due recurrence (no
//! backfill of missed ones) by cloning the base task and advancing
//! `next_occurrence`. Per-recurrence failures are logged and the sweep
//! moves on.

use broker_core::store::RecurrenceStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Sweep cadence.
    pub period: Duration,
    /// Maximum recurrences processed per tick.
    pub batch_limit: u32,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            batch_limit: 100,
        }
    }
}

pub struct RecurrenceMaterializer<S> {
    store: Arc<S>,
    config: MaterializerConfig,
}

impl<S: RecurrenceStore + 'static> RecurrenceMaterializer<S> {
    pub fn new(store: Arc<S>, config: MaterializerConfig) -> Self {
        Self { store, config }
    }

    /// One sweep over due recurrences; returns the number of instances
    /// materialized.
    pub async fn tick_once(&self) -> usize {
        let due = match self
            .store
            .due_recurrences(Utc::now(), self.config.batch_limit)
            .await
        {
            Ok(due) => due,
            Err(error) => {
                error!(%error, "failed to list due recurrences");
                return 0;
            }
        };

        let mut materialized = 0;
        for recurrence in due {
            match self.store.materialize_instance(None, recurrence.id).await {
                Ok((instance, advanced)) => {
                    info!(
                        recurrence_id = recurrence.id,
                        instance_id = instance.id,
                        next_occurrence = %advanced.next_occurrence,
                        "materialized recurring task"
                    );
                    materialized += 1;
                }
                Err(error) => {
                    error!(recurrence_id = recurrence.id, %error, "materialization failed");
                }
            }
        }
        materialized
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_secs = self.config.period.as_secs(),
            "recurrence materializer started"
        );
        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let store = self.store.clone();
                    let config = self.config.clone();
                    let sweep = tokio::spawn(async move {
                        RecurrenceMaterializer { store, config }.tick_once().await
                    })
                    .await;
                    if let Err(join_error) = sweep {
                        warn!(%join_error, "materializer sweep panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("recurrence materializer stopped");
    }
}
