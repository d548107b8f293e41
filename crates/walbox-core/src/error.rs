use thiserror::Error;

/// Errors raised while building or publishing outbox messages.
#[derive(Debug, Error)]
pub enum Error {
    /// A column the message needs was absent or NULL in the row.
    #[error("outbox row is missing column '{0}'")]
    MissingColumn(String),

    #[error("outbox column '{column}' holds {actual}, expected {expected}")]
    InvalidColumnType {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// Returned by a [`crate::Publisher`] when the broker rejected or never saw the message.
    #[error("publish failed: {0}")]
    Publish(String),
}

pub type Result<T> = std::result::Result<T, Error>;
