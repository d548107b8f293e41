use crate::config::WalboxConfig;
use crate::connection::ConnectionParams;
use crate::error::{ConfigError, ConfigResult};

/// Postgres truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Slot names are `<prefix>_<32 hex chars>` and must fit in an identifier.
const MAX_SLOT_PREFIX_LEN: usize = MAX_IDENTIFIER_LEN - 33;

/// Validate a configuration.
pub fn validate_config(config: &WalboxConfig) -> ConfigResult<()> {
    validate_names(config)?;
    validate_slot_prefix(&config.replication.slot_prefix)?;
    validate_intervals(config)?;
    validate_retry(config)?;
    validate_database(config)?;
    Ok(())
}

/// Whether `s` is a plain unquoted SQL identifier.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_names(config: &WalboxConfig) -> ConfigResult<()> {
    let names = [
        ("outbox.schema", &config.outbox.schema),
        ("outbox.table", &config.outbox.table),
        ("outbox.publication", &config.outbox.publication),
        ("outbox.heartbeat_table", &config.outbox.heartbeat_table),
    ];

    for (field, value) in names {
        if !is_identifier(value) {
            return Err(ConfigError::InvalidIdentifier {
                field: field.to_string(),
                value: value.clone(),
            });
        }
    }
    Ok(())
}

fn validate_slot_prefix(prefix: &str) -> ConfigResult<()> {
    let valid_chars = prefix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if prefix.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidIdentifier {
            field: "replication.slot_prefix".to_string(),
            value: prefix.to_string(),
        });
    }
    if prefix.len() > MAX_SLOT_PREFIX_LEN {
        return Err(ConfigError::InvalidValue {
            field: "replication.slot_prefix".to_string(),
            message: format!("must be at most {} characters", MAX_SLOT_PREFIX_LEN),
        });
    }
    Ok(())
}

fn validate_intervals(config: &WalboxConfig) -> ConfigResult<()> {
    let intervals = [
        (
            "replication.status_interval_secs",
            config.replication.status_interval_secs,
        ),
        (
            "replication.connect_timeout_secs",
            config.replication.connect_timeout_secs,
        ),
        ("heartbeat.interval_secs", config.heartbeat.interval_secs),
        ("reconcile.interval_secs", config.reconcile.interval_secs),
        (
            "replication.slot_cleanup_interval_secs",
            config.replication.slot_cleanup_interval_secs.unwrap_or(1),
        ),
    ];

    for (field, value) in intervals {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
    }

    if config.reconcile.max_age_days == 0 {
        return Err(ConfigError::InvalidValue {
            field: "reconcile.max_age_days".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn validate_retry(config: &WalboxConfig) -> ConfigResult<()> {
    let replication = &config.replication;

    if replication.max_reconnect_attempts == 0 {
        return Err(ConfigError::InvalidValue {
            field: "replication.max_reconnect_attempts".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    if replication.initial_backoff_ms > replication.max_backoff_ms {
        return Err(ConfigError::InvalidValue {
            field: "replication.initial_backoff_ms".to_string(),
            message: format!(
                "{}ms exceeds max_backoff_ms ({}ms)",
                replication.initial_backoff_ms, replication.max_backoff_ms
            ),
        });
    }
    Ok(())
}

fn validate_database(config: &WalboxConfig) -> ConfigResult<()> {
    let params: ConnectionParams = config.connection_params()?;

    if params.host.is_empty() {
        return Err(ConfigError::MissingField {
            field: "database.host".to_string(),
        });
    }
    if params.dbname.is_empty() {
        return Err(ConfigError::MissingField {
            field: "database.name".to_string(),
        });
    }
    Ok(())
}
