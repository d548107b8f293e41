use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::{ConnectionParams, SslMode};
use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate_config;

/// Top-level configuration as parsed from walbox.toml.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalboxConfig {
    /// Database connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Outbox table and publication names.
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Replication stream tuning.
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Liveness marker settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Catch-up reconciler settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Database connection settings.
///
/// When `url` resolves to a non-empty string it takes precedence over the discrete fields.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dbname")]
    pub name: String,
    #[serde(default = "default_user")]
    pub user: String,
    pub password: Option<String>,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            name: default_dbname(),
            user: default_user(),
            password: None,
            ssl_mode: SslMode::default(),
        }
    }
}

/// Names of the database objects walbox reads and writes.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_publication")]
    pub publication: String,
    #[serde(default = "default_heartbeat_table")]
    pub heartbeat_table: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            table: default_table(),
            publication: default_publication(),
            heartbeat_table: default_heartbeat_table(),
        }
    }
}

/// Replication stream tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Seconds between standby status updates.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Consecutive failed sessions before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// A session must stream this long before the failure count starts over.
    #[serde(default = "default_stable_session")]
    pub stable_session_secs: u64,
    /// Prefix of every temporary slot name.
    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,
    /// Drop inactive slots with our prefix on this interval. Off when unset.
    pub slot_cleanup_interval_secs: Option<u64>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval(),
            connect_timeout_secs: default_connect_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            stable_session_secs: default_stable_session(),
            slot_prefix: default_slot_prefix(),
            slot_cleanup_interval_secs: None,
        }
    }
}

impl ReplicationConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn stable_session(&self) -> Duration {
        Duration::from_secs(self.stable_session_secs)
    }

    pub fn slot_cleanup_interval(&self) -> Option<Duration> {
        self.slot_cleanup_interval_secs.map(Duration::from_secs)
    }
}

/// Liveness marker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Catch-up reconciler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Rows younger than this are left to the stream.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Rows older than this are never re-driven.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconcile_interval(),
            grace_period_secs: default_grace_period(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "outbox".to_string()
}

fn default_publication() -> String {
    "outbox_publication".to_string()
}

fn default_heartbeat_table() -> String {
    "_heartbeat".to_string()
}

fn default_status_interval() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_stable_session() -> u64 {
    30
}

fn default_slot_prefix() -> String {
    "walbox".to_string()
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_grace_period() -> u64 {
    5
}

fn default_max_age_days() -> u32 {
    7
}

impl WalboxConfig {
    /// Parse a config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: WalboxConfig = toml::from_str(toml_str)?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Build a config from the process environment.
    ///
    /// Uses `DATABASE_URL` when set, otherwise `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`,
    /// `DB_PASSWORD` (or `DB_PSWD`) and `DB_SSLMODE`. Everything else keeps its default.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = WalboxConfig::default();
        let db = &mut config.database;

        if let Some(url) = env_var("DATABASE_URL") {
            db.url = Some(url);
            return Ok(config);
        }

        if let Some(host) = env_var("DB_HOST") {
            db.host = host;
        }
        if let Some(port) = env_var("DB_PORT") {
            db.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "DB_PORT".to_string(),
                message: format!("'{}' is not a valid port", port),
            })?;
        }
        if let Some(name) = env_var("DB_NAME") {
            db.name = name;
        }
        if let Some(user) = env_var("DB_USER") {
            db.user = user;
        }
        db.password = env_var("DB_PASSWORD").or_else(|| env_var("DB_PSWD"));
        if let Some(mode) = env_var("DB_SSLMODE") {
            db.ssl_mode = mode.parse()?;
        }

        Ok(config)
    }

    /// Validate names, intervals and retry settings.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_config(self)
    }

    /// Resolve the connection parameters, expanding `${VAR}` references.
    pub fn connection_params(&self) -> ConfigResult<ConnectionParams> {
        let db = &self.database;

        if let Some(url) = db.url.as_deref().map(resolve_env) {
            if !url.trim().is_empty() {
                return ConnectionParams::from_url(&url);
            }
        }

        let password = db
            .password
            .as_deref()
            .map(resolve_env)
            .filter(|p| !p.is_empty());

        Ok(ConnectionParams {
            host: resolve_env(&db.host),
            port: db.port,
            dbname: resolve_env(&db.name),
            user: resolve_env(&db.user),
            password,
            ssl_mode: db.ssl_mode,
        })
    }

    /// Fully qualified outbox table, for logging.
    pub fn outbox_table(&self) -> String {
        format!("{}.{}", self.outbox.schema, self.outbox.table)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; unset variables resolve to an empty string.
pub fn resolve_env(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    // substituted values are copied as-is and never rescanned
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        result.push_str(&std::env::var(&rest[start + 2..start + end]).unwrap_or_default());
        rest = &rest[start + end + 1..];
    }

    result.push_str(rest);
    result
}
