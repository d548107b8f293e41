//! Delivery pipeline: decoded row to outbox message to publisher, then sent bookkeeping.

use std::sync::Arc;

use tracing::{debug, warn};
use walbox_core::{DecodedRow, OutboxMessage, Publisher};

use crate::error::PgResult;
use crate::store::{Capabilities, OutboxStore};

/// Publishes outbox messages and records them as sent.
///
/// Shared by the stream and the reconciler; cloning is cheap.
pub struct Delivery<P, S> {
    publisher: Arc<P>,
    store: Arc<S>,
    capabilities: Capabilities,
}

impl<P, S> Clone for Delivery<P, S> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            store: self.store.clone(),
            capabilities: self.capabilities,
        }
    }
}

impl<P: Publisher, S: OutboxStore> Delivery<P, S> {
    pub fn new(publisher: Arc<P>, store: Arc<S>, capabilities: Capabilities) -> Self {
        Self {
            publisher,
            store,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Map a decoded row to an outbox message and deliver it. Returns the message id.
    pub async fn deliver_row(&self, row: &DecodedRow) -> PgResult<i64> {
        let message = OutboxMessage::from_row(row)?;
        let id = message.id;
        self.deliver(message).await?;
        Ok(id)
    }

    /// Publish once, then mark the row sent.
    ///
    /// A failed mark is logged; the delivery still succeeded and the reconciler may
    /// publish the row again.
    pub async fn deliver(&self, message: OutboxMessage) -> PgResult<()> {
        let id = message.id;
        self.publisher.tail(message).await?;
        debug!(id, "Published outbox message");

        if !self.capabilities.has_sent_column {
            return Ok(());
        }

        if let Err(e) = self.store.mark_sent(id).await {
            warn!(id, error = %e, "Failed to mark outbox message as sent");
        }
        Ok(())
    }
}
