//! Background expiry sweeper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::index::{RecordIndex, SweepReport};

/// Handle for a running sweeper task.
pub struct SweeperHandle {
    shutdown_tx: broadcast::Sender<()>,
    reports: tokio::sync::watch::Receiver<SweepReport>,
    handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Returns a receiver that observes the report of each completed sweep.
    pub fn reports(&self) -> tokio::sync::watch::Receiver<SweepReport> {
        self.reports.clone()
    }

    /// Signals the sweeper to stop after the current cycle.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stops the sweeper and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.handle.await;
    }
}

/// Spawns a task that sweeps `index` every `interval`.
///
/// Each cycle runs on the blocking pool since eviction and snapshotting touch
/// the disk.
pub fn spawn_sweeper(index: Arc<RecordIndex>, interval: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let (report_tx, reports) = tokio::sync::watch::channel(SweepReport::default());

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!("Cache sweeper running every {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let index = index.clone();
                    match tokio::task::spawn_blocking(move || index.sweep_and_save(Utc::now())).await {
                        Ok(report) => {
                            if report.expired > 0 {
                                debug!(
                                    "Sweep expired {} records ({} eviction failures)",
                                    report.expired, report.evict_failures
                                );
                            }
                            let _ = report_tx.send(report);
                        }
                        Err(e) => error!("Sweep task failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Cache sweeper stopped");
                    break;
                }
            }
        }
    });

    SweeperHandle {
        shutdown_tx,
        reports,
        handle,
    }
}
