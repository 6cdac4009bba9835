//! Reconciliation sweeper background task.
//!
//! Re-drives the reconciler for every tracked block on a timer, so failed
//! syncs are retried without waiting for the next block event. Sleeps for
//! the busy interval while the charge ledger holds anything and for the idle
//! interval when it is empty.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::service::{DepositSync, SweepReport};

/// Sweeper timing.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub busy_interval: Duration,
    pub idle_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            busy_interval: Duration::from_secs(30),
            idle_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl SweeperConfig {
    /// Sleep before the next tick given the number of tracked blocks.
    pub fn interval_for(&self, pending_blocks: usize) -> Duration {
        if pending_blocks == 0 {
            self.idle_interval
        } else {
            self.busy_interval
        }
    }
}

/// Spawn the sweeper. It runs until `shutdown` becomes true.
pub fn spawn_sweeper(
    sync: Arc<DepositSync>,
    config: SweeperConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_sweeper(sync, config, shutdown).await;
    })
}

fn log_report(report: &SweepReport, pending: usize) {
    if report.visited == 0 {
        debug!("Sweep found nothing to do");
        return;
    }
    info!(
        visited = report.visited,
        connected = report.connected,
        disconnected = report.disconnected,
        resolved = report.resolved,
        failed = report.failed,
        skipped_shallow = report.skipped_shallow,
        pending,
        "Sweep complete"
    );
}

/// Main sweeper loop.
pub async fn run_sweeper(
    sync: Arc<DepositSync>,
    config: SweeperConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        busy_secs = config.busy_interval.as_secs(),
        idle_secs = config.idle_interval.as_secs(),
        sweep_depth = sync.sweep_depth(),
        "Starting reconciliation sweeper"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let report = sync.sweep_once(&shutdown).await;
        let pending = sync.pending_blocks().await;
        log_report(&report, pending);

        let sleep = config.interval_for(pending);
        debug!("Next sweep in {:?}", sleep);

        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Reconciliation sweeper stopped");
}
