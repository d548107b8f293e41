mod config;
mod connection;
mod error;
mod validation;

pub use config::{
    resolve_env, DatabaseConfig, HeartbeatConfig, OutboxConfig, ReconcileConfig,
    ReplicationConfig, WalboxConfig,
};
pub use connection::{ConnectionParams, SslMode};
pub use error::{ConfigError, ConfigResult};
pub use validation::{is_identifier, validate_config};
