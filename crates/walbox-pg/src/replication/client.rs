//! Push-based replication session: slot, position tracking, acknowledgment and decoding.

use std::fmt;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walbox_config::{ConnectionParams, WalboxConfig};
use walbox_core::{DecodedRow, Publisher};

use super::decode::decode_row;
use super::lsn::{format_lsn, WalPosition};
use super::pgoutput::{PgOutputDecoder, PgOutputMessage};
use super::registry::{RelationRegistry, RelationSchema};
use super::slot::temporary_slot_name;
use super::wire::{ReplicationConnection, ReplicationFrame};
use crate::delivery::Delivery;
use crate::error::PgResult;
use crate::store::OutboxStore;

/// Lifecycle of the replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connected,
    SlotActive,
    Streaming,
    Reconnecting,
    Terminated,
}

impl StreamState {
    /// Move to `next`, logging the transition.
    pub fn transition(&mut self, next: StreamState) {
        if *self != next {
            info!(from = %self, to = %next, "Replication stream state changed");
            *self = next;
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connected => "connected",
            StreamState::SlotActive => "slot_active",
            StreamState::Streaming => "streaming",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Settings for one replication session.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub params: ConnectionParams,
    pub connect_timeout: Duration,
    pub status_interval: Duration,
    pub slot_prefix: String,
    pub publication: String,
}

impl StreamSettings {
    pub fn from_config(config: &WalboxConfig) -> PgResult<Self> {
        Ok(Self {
            params: config.connection_params()?,
            connect_timeout: config.replication.connect_timeout(),
            status_interval: config.replication.status_interval(),
            slot_prefix: config.replication.slot_prefix.clone(),
            publication: config.outbox.publication.clone(),
        })
    }
}

/// Per-session consumer state: relation registry, decoder and tracked position.
///
/// Knows nothing about the transport; the session feeds it frames.
#[derive(Debug)]
pub struct WalConsumer {
    registry: RelationRegistry,
    decoder: PgOutputDecoder,
    position: WalPosition,
}

impl WalConsumer {
    pub fn new(start_lsn: u64) -> Self {
        Self {
            registry: RelationRegistry::new(),
            decoder: PgOutputDecoder::new(),
            position: WalPosition::new(start_lsn),
        }
    }

    /// Position to report in the next standby status update.
    pub fn position(&self) -> WalPosition {
        self.position
    }

    pub fn registry(&self) -> &RelationRegistry {
        &self.registry
    }

    /// Handle a primary keepalive. Returns whether the server asked for an immediate reply.
    pub fn on_keepalive(&mut self, wal_end: u64, reply_requested: bool) -> bool {
        if self.position.advance(wal_end) {
            debug!(lsn = %self.position, "Keepalive advanced position");
        }
        reply_requested
    }

    /// Handle one XLogData payload. Returns a row for each insert that decodes cleanly.
    ///
    /// Bad frames, unknown relations and undecodable rows are logged and skipped.
    pub fn on_xlog(&mut self, wal_start: u64, data: &[u8]) -> Option<DecodedRow> {
        self.position.advance(wal_start);

        let message = match self.decoder.decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(lsn = %format_lsn(wal_start), error = %e, "Skipping undecodable WAL record");
                return None;
            }
        };

        match message {
            PgOutputMessage::Relation(relation) => {
                let schema = RelationSchema::from(&relation);
                debug!(
                    relation_id = relation.relation_id,
                    table = %schema.qualified_name(),
                    columns = schema.columns.len(),
                    "Registered relation"
                );
                self.registry.add(relation.relation_id, schema);
                None
            }
            PgOutputMessage::Insert(insert) => {
                let schema = match self.registry.lookup(insert.relation_id) {
                    Ok(schema) => schema,
                    Err(e) => {
                        warn!(error = %e, "Skipping insert for undeclared relation");
                        return None;
                    }
                };
                match decode_row(schema, &insert.tuple) {
                    Ok(row) => Some(row),
                    Err(e) => {
                        warn!(
                            table = %schema.qualified_name(),
                            error = %e,
                            "Skipping undecodable row"
                        );
                        None
                    }
                }
            }
            PgOutputMessage::Begin(begin) => {
                debug!(xid = begin.xid, final_lsn = %format_lsn(begin.final_lsn), "Begin");
                None
            }
            PgOutputMessage::Commit(commit) => {
                debug!(commit_lsn = %format_lsn(commit.commit_lsn), "Commit");
                None
            }
            PgOutputMessage::Other(tag) => {
                debug!(tag = %(tag as char), "Ignoring pgoutput message");
                None
            }
        }
    }
}

/// One replication session from connect to stream end.
pub struct ReplicationSession {
    conn: ReplicationConnection,
    slot_name: String,
    consumer: WalConsumer,
    status_interval: Duration,
}

impl ReplicationSession {
    /// Connect in replication mode, create a temporary slot and start streaming.
    ///
    /// `state` is moved through `Connected`, `SlotActive` and `Streaming` as each step
    /// succeeds.
    pub async fn open(settings: &StreamSettings, state: &mut StreamState) -> PgResult<Self> {
        let mut conn =
            ReplicationConnection::connect(&settings.params, settings.connect_timeout).await?;
        state.transition(StreamState::Connected);

        let slot_name = temporary_slot_name(&settings.slot_prefix);
        conn.create_temporary_slot(&slot_name).await?;
        let identity = conn.identify_system().await?;
        info!(
            slot = %slot_name,
            system_id = %identity.system_id,
            timeline = identity.timeline,
            lsn = %format_lsn(identity.xlogpos),
            "Created temporary replication slot"
        );
        state.transition(StreamState::SlotActive);

        conn.start_replication(&slot_name, identity.xlogpos, &settings.publication)
            .await?;
        state.transition(StreamState::Streaming);

        Ok(Self {
            conn,
            slot_name,
            consumer: WalConsumer::new(identity.xlogpos),
            status_interval: settings.status_interval,
        })
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    /// Receive until cancelled or the transport fails.
    ///
    /// Returns `Ok(())` on cancellation after closing the connection. Any transport
    /// failure is returned so the caller can reconnect.
    pub async fn run<P, S>(mut self, delivery: &Delivery<P, S>, cancel: &CancellationToken) -> PgResult<()>
    where
        P: Publisher,
        S: OutboxStore,
    {
        let mut ack = interval_at(Instant::now() + self.status_interval, self.status_interval);
        ack.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ack.tick() => self.acknowledge().await?,
                frame = self.conn.recv() => self.handle(frame?, delivery).await?,
            }
        }

        info!(slot = %self.slot_name, lsn = %self.consumer.position(), "Closing replication session");
        self.conn.close().await;
        Ok(())
    }

    async fn handle<P, S>(&mut self, frame: ReplicationFrame, delivery: &Delivery<P, S>) -> PgResult<()>
    where
        P: Publisher,
        S: OutboxStore,
    {
        match frame {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                if self.consumer.on_keepalive(wal_end, reply_requested) {
                    self.acknowledge().await?;
                }
            }
            ReplicationFrame::XLogData { wal_start, data, .. } => {
                if let Some(row) = self.consumer.on_xlog(wal_start, &data) {
                    match delivery.deliver_row(&row).await {
                        Ok(id) => debug!(id, "Delivered outbox message from stream"),
                        Err(e) => error!(error = %e, "Failed to deliver outbox message from stream"),
                    }
                }
            }
            ReplicationFrame::Other(kind) => {
                debug!(kind = %(kind as char), "Ignoring CopyData message");
            }
        }
        Ok(())
    }

    async fn acknowledge(&mut self) -> PgResult<()> {
        let lsn = self.consumer.position();
        self.conn.send_standby_status(lsn.get()).await?;
        debug!(lsn = %lsn, "Sent standby status update");
        Ok(())
    }
}
