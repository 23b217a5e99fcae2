use crate::coordinator::Coordinator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Periodic maintenance driver for a [`Coordinator`].
///
/// Timeout sweeps and liveness scans run on a fixed period rather than with
/// per-task timers.
pub struct MaintenanceLoop {
    coordinator: Arc<Coordinator>,
    period: Duration,
}

impl MaintenanceLoop {
    /// Loop with an explicit period.
    pub fn new(coordinator: Arc<Coordinator>, period: Duration) -> Self {
        Self {
            coordinator,
            period,
        }
    }

    /// Use the configured sweep interval.
    pub fn from_config(coordinator: Arc<Coordinator>) -> Self {
        let period = coordinator.config().queue.sweep_interval();
        Self::new(coordinator, period)
    }

    /// Time between passes.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Spawn the loop. It runs [`Coordinator::maintenance_tick`] every period
    /// until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Returns the [`JoinHandle`] so the caller can await or abort it.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(period_ms = self.period.as_millis() as u64, "Maintenance loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.coordinator.maintenance_tick(Utc::now());
                        if report.is_quiet() {
                            debug!("Maintenance pass: nothing to do");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Maintenance loop stopped");
        })
    }
}
