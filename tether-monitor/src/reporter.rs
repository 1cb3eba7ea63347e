//! Periodic usage reporting.

use crate::ResourceMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// Publishes a usage report every `interval` until `shutdown_rx` flips to
/// true or its sender is dropped. The first report is due one interval
/// after start.
pub async fn run_reporter(
    monitor: Arc<ResourceMonitor>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(?interval, "Usage reporter started");
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                monitor.publish_report();
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Usage reporter stopped");
                    break;
                }
            }
        }
    }
}

/// Handle to a reporter spawned with [`spawn_reporter`].
#[derive(Debug)]
pub struct ReporterHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReporterHandle {
    /// Signals the reporter to stop and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawns [`run_reporter`] on the current runtime using the monitor's
/// configured interval.
#[must_use]
pub fn spawn_reporter(monitor: Arc<ResourceMonitor>) -> ReporterHandle {
    let interval = monitor.config().report_interval();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_reporter(monitor, interval, shutdown_rx));
    ReporterHandle { shutdown_tx, task }
}
