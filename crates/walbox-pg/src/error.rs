use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server error: {severity}: {message} (code: {code})")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    #[error("relation {0} not found in registry")]
    RelationNotFound(u32),

    #[error("failed to decode column '{column}': {message}")]
    Decode { column: String, message: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("replication stream ended")]
    StreamEnded,

    #[error("gave up after {attempts} consecutive failed attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Core(#[from] walbox_core::Error),

    #[error(transparent)]
    Config(#[from] walbox_config::ConfigError),
}

impl PgError {
    /// SQLSTATE of a server-reported error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            PgError::Server {
                severity: db_err.severity().to_string(),
                code: db_err.code().code().to_string(),
                message: db_err.message().to_string(),
            }
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
