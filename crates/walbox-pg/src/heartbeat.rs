//! Periodic background loops that only touch storage: heartbeat and slot janitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{OutboxStore, PostgresOutboxStore};

/// Upsert the liveness marker every `period` until cancelled. Failures are warnings.
pub async fn run_heartbeat<S: OutboxStore>(store: Arc<S>, period: Duration, cancel: CancellationToken) {
    info!(interval_secs = period.as_secs(), "Heartbeat started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match store.heartbeat().await {
            Ok(()) => debug!("Heartbeat written"),
            Err(e) => warn!(error = %e, "Failed to write heartbeat"),
        }
    }

    debug!("Heartbeat stopped");
}

/// Drop leftover inactive slots with our prefix every `period` until cancelled.
pub async fn run_slot_janitor(
    store: Arc<PostgresOutboxStore>,
    prefix: String,
    period: Duration,
    cancel: CancellationToken,
) {
    info!(prefix = %prefix, interval_secs = period.as_secs(), "Slot janitor started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match store.drop_inactive_slots(&prefix).await {
            Ok(dropped) if !dropped.is_empty() => {
                info!(count = dropped.len(), "Dropped inactive replication slots")
            }
            Ok(_) => debug!("No inactive replication slots"),
            Err(e) => warn!(error = %e, "Failed to clean up replication slots"),
        }
    }

    debug!("Slot janitor stopped");
}
