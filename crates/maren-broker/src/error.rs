//! Broker error types.

use thiserror::Error;

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A stored payload could not be (de)serialized.
    #[error("payload codec error on {key}: {source}")]
    Codec {
        /// The list or cache key involved.
        key: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
