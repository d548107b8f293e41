//! Catch-up reconciler: re-drives unsent outbox rows the stream may have missed.

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walbox_config::ReconcileConfig;
use walbox_core::Publisher;

use crate::delivery::Delivery;
use crate::error::PgResult;
use crate::store::{OutboxStore, ReconcileWindow};

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub found: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct Reconciler<P, S> {
    delivery: Delivery<P, S>,
    window: ReconcileWindow,
    interval: Duration,
}

impl<P: Publisher, S: OutboxStore> Reconciler<P, S> {
    pub fn new(delivery: Delivery<P, S>, config: &ReconcileConfig) -> Self {
        Self {
            delivery,
            window: ReconcileWindow {
                grace: config.grace_period(),
                max_age_days: config.max_age_days,
            },
            interval: config.interval(),
        }
    }

    pub fn window(&self) -> ReconcileWindow {
        self.window
    }

    /// Deliver every unsent row in the window. A failing row does not stop the pass.
    pub async fn reconcile_once(&self) -> PgResult<ReconcileReport> {
        let pending = self.delivery.store().fetch_unsent(self.window).await?;
        let mut report = ReconcileReport {
            found: pending.len(),
            ..Default::default()
        };

        for message in pending {
            let id = message.id;
            match self.delivery.deliver(message).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    error!(id, error = %e, "Failed to re-publish outbox message");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run passes on a fixed interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.window.grace.as_secs(),
            max_age_days = self.window.max_age_days,
            "Reconciler started"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reconcile_once().await {
                Ok(report) if report.found > 0 => info!(
                    found = report.found,
                    delivered = report.delivered,
                    failed = report.failed,
                    "Reconcile pass complete"
                ),
                Ok(_) => debug!("Reconcile pass found nothing"),
                Err(e) => warn!(error = %e, "Reconcile pass failed"),
            }
        }

        debug!("Reconciler stopped");
    }
}
