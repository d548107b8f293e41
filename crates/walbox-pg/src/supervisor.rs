//! Top-level orchestration: setup, background loops and the reconnecting stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use walbox_config::{ReplicationConfig, WalboxConfig};
use walbox_core::Publisher;

use crate::delivery::Delivery;
use crate::error::{PgError, PgResult};
use crate::heartbeat::{run_heartbeat, run_slot_janitor};
use crate::reconcile::Reconciler;
use crate::replication::{ReplicationSession, StreamSettings, StreamState};
use crate::store::{Capabilities, OutboxStore, PostgresOutboxStore};

/// Bounded exponential backoff between replication sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Sessions that stream at least this long clear the failure count.
    pub stable_after: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            stable_after: config.stable_session(),
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

/// Runs replication sessions back to back until cancelled or out of retries.
pub struct StreamRunner {
    settings: StreamSettings,
    policy: ReconnectPolicy,
}

impl StreamRunner {
    pub fn new(settings: StreamSettings, policy: ReconnectPolicy) -> Self {
        Self { settings, policy }
    }

    /// Stream until `cancel` fires (returns `Ok`) or `max_attempts` consecutive
    /// sessions fail (returns [`PgError::ReconnectExhausted`]).
    ///
    /// The failure counter resets only after a session has streamed for `stable_after`.
    /// Sessions that end sooner count against the budget like a failed connect.
    pub async fn run<P, S>(&self, delivery: &Delivery<P, S>, cancel: &CancellationToken) -> PgResult<()>
    where
        P: Publisher,
        S: OutboxStore,
    {
        let mut state = StreamState::Disconnected;
        let mut failures: u32 = 0;

        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = ReplicationSession::open(&self.settings, &mut state) => opened,
            };

            let result = match opened {
                Ok(session) => {
                    info!(slot = %session.slot_name(), "Replication stream started");
                    let started = Instant::now();
                    let result = session.run(delivery, cancel).await;
                    if started.elapsed() >= self.policy.stable_after {
                        failures = 0;
                    }
                    result
                }
                Err(e) => Err(e),
            };

            let e = match result {
                Ok(()) => break,
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => e,
            };

            failures += 1;
            if failures >= self.policy.max_attempts {
                state.transition(StreamState::Terminated);
                error!(attempts = failures, error = %e, "Giving up on replication stream");
                return Err(PgError::ReconnectExhausted { attempts: failures });
            }

            let delay = self.policy.backoff(failures - 1);
            state.transition(StreamState::Reconnecting);
            warn!(
                attempt = failures,
                max_attempts = self.policy.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %e,
                "Replication session ended, reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        state.transition(StreamState::Terminated);
        Ok(())
    }
}

/// Owns a configuration and a publisher and runs the whole outbox relay.
pub struct Supervisor<P> {
    config: WalboxConfig,
    publisher: Arc<P>,
}

impl<P: Publisher + 'static> Supervisor<P> {
    pub fn new(config: WalboxConfig, publisher: Arc<P>) -> Self {
        Self { config, publisher }
    }

    /// Set up storage, start background loops and stream until cancelled.
    ///
    /// Connecting and ensuring the publication are retried under the reconnect policy.
    /// Only invalid configuration and an exhausted retry budget are returned.
    pub async fn run(self, cancel: CancellationToken) -> PgResult<()> {
        let settings = StreamSettings::from_config(&self.config)?;
        let policy = ReconnectPolicy::from_config(&self.config.replication);
        let store = Arc::new(PostgresOutboxStore::new(&self.config)?);

        let storage = store.as_ref();
        let ready = retry_setup(&policy, &cancel, "ensure_publication", move || {
            storage.ensure_publication()
        })
        .await?;
        if ready.is_none() {
            info!("Cancelled during setup");
            return Ok(());
        }

        if let Err(e) = store.ensure_heartbeat_table().await {
            warn!(error = %e, "Failed to create heartbeat table");
        }
        let capabilities = match store.probe_capabilities().await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                warn!(error = %e, "Failed to probe outbox columns, assuming no sent column");
                Capabilities::default()
            }
        };

        let delivery = Delivery::new(self.publisher.clone(), store.clone(), capabilities);
        let background = cancel.child_token();
        let tasks = self.spawn_background(&store, &delivery, &background);

        let runner = StreamRunner::new(settings, policy);
        let result = runner.run(&delivery, &cancel).await;

        background.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!("Supervisor stopped");
        result
    }

    fn spawn_background(
        &self,
        store: &Arc<PostgresOutboxStore>,
        delivery: &Delivery<P, PostgresOutboxStore>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_heartbeat(
            store.clone(),
            self.config.heartbeat.interval(),
            cancel.child_token(),
        )));

        if !self.config.reconcile.enabled {
            info!("Reconciler disabled by configuration");
        } else if !delivery.capabilities().has_sent_column {
            info!("Reconciler disabled: outbox table has no sent column");
        } else {
            let reconciler = Reconciler::new(delivery.clone(), &self.config.reconcile);
            tasks.push(tokio::spawn(reconciler.run(cancel.child_token())));
        }

        if let Some(period) = self.config.replication.slot_cleanup_interval() {
            tasks.push(tokio::spawn(run_slot_janitor(
                store.clone(),
                self.config.replication.slot_prefix.clone(),
                period,
                cancel.child_token(),
            )));
        }

        tasks
    }
}

/// Run a setup step until it succeeds, retrying with the policy's backoff.
///
/// Returns `None` when cancelled and [`PgError::ReconnectExhausted`] once
/// `max_attempts` consecutive tries have failed.
async fn retry_setup<T, F, Fut>(
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
    step: &str,
    mut op: F,
) -> PgResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PgResult<T>>,
{
    let mut failures: u32 = 0;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = op() => result,
        };
        let e = match result {
            Ok(value) => return Ok(Some(value)),
            Err(e) => e,
        };

        failures += 1;
        if failures >= policy.max_attempts {
            error!(step, attempts = failures, error = %e, "Giving up on setup");
            return Err(PgError::ReconnectExhausted { attempts: failures });
        }

        let delay = policy.backoff(failures - 1);
        warn!(
            step,
            attempt = failures,
            backoff_ms = delay.as_millis() as u64,
            error = %e,
            "Setup step failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
