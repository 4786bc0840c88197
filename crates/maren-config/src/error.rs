//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A config file could not be parsed as TOML.
    #[error("failed to parse {path}: {source}")]
    ParseError {
        /// Path (or `<embedded defaults>`).
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// An environment override had an unparseable value.
    #[error("invalid value for {var}: {message}")]
    EnvError {
        /// Variable name.
        var: String,
        /// What was wrong.
        message: String,
    },

    /// A field failed validation.
    #[error("invalid config: {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What was wrong.
        message: String,
    },
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
