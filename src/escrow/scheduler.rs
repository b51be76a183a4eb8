//! Background auto-release job

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::model::AutoReleaseReport;
use super::service::EscrowManager;
use crate::error::ApiResult;

/// Runs auto-release sweeps on a fixed interval until shut down
pub struct AutoReleaseScheduler {
    escrow: Arc<EscrowManager>,
    interval: Duration,
}

impl AutoReleaseScheduler {
    pub fn new(escrow: Arc<EscrowManager>, interval: Duration) -> Self {
        Self { escrow, interval }
    }

    pub async fn run_once(&self) -> ApiResult<AutoReleaseReport> {
        self.escrow.process_auto_release().await
    }

    /// Sweep on every tick until `shutdown` flips to `true`.
    ///
    /// A sweep in progress finishes before the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Starting auto-release scheduler"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!("Error running auto-release sweep: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Auto-release scheduler stopped");
    }
}
