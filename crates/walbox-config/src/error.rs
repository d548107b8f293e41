use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid identifier for {field}: '{value}'")]
    InvalidIdentifier { field: String, value: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid sslmode '{value}': expected one of disable, prefer, require, verify-ca, verify-full")]
    InvalidSslMode { value: String },

    #[error("invalid database url: {0}")]
    InvalidUrl(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
