use std::future::Future;

use tracing::info;
use walbox_core::{OutboxMessage, Publisher, Result};

/// Publisher that writes each message to stdout as one JSON line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl LogPublisher {
    fn render(message: &OutboxMessage) -> Result<String> {
        Ok(serde_json::to_string(message)?)
    }
}

impl Publisher for LogPublisher {
    fn tail(&self, message: OutboxMessage) -> impl Future<Output = Result<()>> + Send {
        async move {
            let line = Self::render(&message)?;
            println!("{}", line);
            info!(
                id = message.id,
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                correlation_id = %message.correlation_id,
                "Published outbox message"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboxMessage {
        OutboxMessage {
            id: 42,
            message: serde_json::json!({"order": 42}),
            exchange: "orders".to_string(),
            routing_key: "order.created".to_string(),
            correlation_id: "c-42".to_string(),
            reply_to: String::new(),
            virtual_host: "/".to_string(),
            created_at: None,
            sent: false,
        }
    }

    #[test]
    fn test_render_uses_storage_column_names() {
        let line = LogPublisher::render(&message()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["id"], 42);
        assert_eq!(value["router_key"], "order.created");
        assert_eq!(value["v_host"], "/");
        assert_eq!(value["message"]["order"], 42);
        assert!(!line.contains('\n'));
    }

    #[tokio::test]
    async fn test_tail_succeeds() {
        LogPublisher.tail(message()).await.unwrap();
    }
}
