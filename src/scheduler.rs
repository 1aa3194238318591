//! Long-running schedule: an hourly acquisition cycle and a five-minute
//! lifecycle sweep. A failed tick is logged and the schedule carries on.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::config::Config;
use crate::lifecycle::LifecycleEngine;
use crate::sync::SyncEngine;

pub struct Scheduler {
    sync: Arc<SyncEngine>,
    lifecycle: Arc<LifecycleEngine>,
    config: Config,
}

impl Scheduler {
    pub fn new(sync: Arc<SyncEngine>, lifecycle: Arc<LifecycleEngine>, config: Config) -> Self {
        Self { sync, lifecycle, config }
    }

    /// Runs both loops until the process is stopped.
    pub async fn run(&self) {
        let sync_engine = Arc::clone(&self.sync);
        let sync_minutes = self.config.sync.interval_minutes;
        let sync_loop = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(sync_minutes * 60));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match sync_engine.run_all().await {
                    Ok(outcomes) => info!(companies = outcomes.len(), "sync cycle finished"),
                    Err(e) => error!(error = %e, "sync cycle failed"),
                }
            }
        });

        let lifecycle_engine = Arc::clone(&self.lifecycle);
        let sweep_minutes = self.config.lifecycle.interval_minutes;
        let sweep_loop = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(sweep_minutes * 60));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match lifecycle_engine.sweep().await {
                    Ok(Some(report)) => info!(
                        processed = report.processed,
                        completed = report.completed,
                        "sweep finished"
                    ),
                    Ok(None) => info!("sweep skipped, lock held elsewhere"),
                    Err(e) => error!(error = %e, "sweep failed"),
                }
            }
        });

        let _ = tokio::join!(sync_loop, sweep_loop);
    }
}
