use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::message::OutboxMessage;
use crate::publisher::Publisher;

/// A mock publisher for testing.
#[derive(Clone, Default)]
pub struct MockPublisher {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    /// Messages that were published successfully, in call order.
    published: Vec<OutboxMessage>,
    /// Number of `tail` calls, including failed ones.
    attempts: usize,
    /// If set, every call fails with this error.
    fail_with: Option<String>,
    /// Remaining forced failures per message id.
    fail_ids: HashMap<i64, usize>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock publisher that rejects every message.
    pub fn failing(error_message: impl Into<String>) -> Self {
        let publisher = Self::new();
        publisher.state.lock().unwrap().fail_with = Some(error_message.into());
        publisher
    }

    /// Fail the next `times` publishes of message `id`.
    pub fn fail_id(&self, id: i64, times: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_ids.insert(id, times);
    }

    /// Stop failing every call.
    pub fn recover(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_with = None;
        state.fail_ids.clear();
    }

    /// All successfully published messages.
    pub fn published(&self) -> Vec<OutboxMessage> {
        self.state.lock().unwrap().published.clone()
    }

    /// Ids of successfully published messages, in order.
    pub fn published_ids(&self) -> Vec<i64> {
        let state = self.state.lock().unwrap();
        state.published.iter().map(|m| m.id).collect()
    }

    /// Total number of `tail` calls.
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.published.clear();
        state.attempts = 0;
    }
}

impl Publisher for MockPublisher {
    fn tail(&self, message: OutboxMessage) -> impl Future<Output = Result<()>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap();
            state.attempts += 1;

            if let Some(ref error) = state.fail_with {
                return Err(Error::Publish(error.clone()));
            }

            if let Some(remaining) = state.fail_ids.get_mut(&message.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Publish(format!(
                        "forced failure for message {}",
                        message.id
                    )));
                }
            }

            state.published.push(message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64) -> OutboxMessage {
        OutboxMessage {
            id,
            message: serde_json::json!({"n": id}),
            exchange: "ex".into(),
            routing_key: "rk".into(),
            correlation_id: String::new(),
            reply_to: String::new(),
            virtual_host: String::new(),
            created_at: None,
            sent: false,
        }
    }

    #[tokio::test]
    async fn test_mock_records_publishes() {
        let publisher = MockPublisher::new();
        publisher.tail(message(1)).await.unwrap();
        publisher.tail(message(2)).await.unwrap();

        assert_eq!(publisher.published_ids(), vec![1, 2]);
        assert_eq!(publisher.attempts(), 2);
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let publisher = MockPublisher::failing("broker down");
        let err = publisher.tail(message(1)).await.unwrap_err();

        assert!(matches!(err, Error::Publish(ref m) if m == "broker down"));
        assert!(publisher.published().is_empty());

        publisher.recover();
        publisher.tail(message(1)).await.unwrap();
        assert_eq!(publisher.published_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_mock_fail_id_once() {
        let publisher = MockPublisher::new();
        publisher.fail_id(2, 1);

        assert!(publisher.tail(message(2)).await.is_err());
        publisher.tail(message(2)).await.unwrap();
        publisher.tail(message(3)).await.unwrap();

        assert_eq!(publisher.published_ids(), vec![2, 3]);
        assert_eq!(publisher.attempts(), 3);
    }

    #[tokio::test]
    async fn test_arc_publisher_delegates() {
        let publisher = Arc::new(MockPublisher::new());
        publisher.tail(message(5)).await.unwrap();
        assert_eq!(publisher.published_ids(), vec![5]);
    }
}
