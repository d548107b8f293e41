use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::message::OutboxMessage;

/// Trait for the downstream sink that finally delivers an outbox message.
///
/// A successful return means the message was handed off; the caller then records the
/// row as sent. Implementations must tolerate duplicates since delivery is at-least-once.
pub trait Publisher: Send + Sync {
    /// Publish a single message.
    fn tail(&self, message: OutboxMessage) -> impl Future<Output = Result<()>> + Send;
}

impl<P: Publisher> Publisher for Arc<P> {
    fn tail(&self, message: OutboxMessage) -> impl Future<Output = Result<()>> + Send {
        (**self).tail(message)
    }
}
