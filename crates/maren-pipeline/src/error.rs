//! Pipeline error types.

use maren_core::{ErrorKind, PlatformError};
use thiserror::Error;

/// Errors raised by pipeline components.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Message store failure.
    #[error(transparent)]
    Store(#[from] maren_store::StoreError),

    /// Broker failure.
    #[error(transparent)]
    Broker(#[from] maren_broker::BrokerError),

    /// Router / provider failure.
    #[error(transparent)]
    Llm(#[from] maren_llm::LlmError),

    /// Memory failure.
    #[error(transparent)]
    Memory(#[from] maren_memory::MemoryError),

    /// Chat transport failure.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// A recovery pass is already active.
    #[error("a recovery operation is already running")]
    AlreadyRunning,

    /// The recovery circuit breaker is open.
    #[error("recovery circuit breaker open, retry in {retry_after_secs}s")]
    CircuitOpen {
        /// Seconds until the scheduled retry.
        retry_after_secs: u64,
    },

    /// Invariant violation or corrupt queue entry. Operator attention.
    #[error("fatal pipeline error: {0}")]
    Fatal(String),
}

impl PipelineError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Llm(e) => e.kind(),
            Self::Platform(e) => e.kind(),
            Self::Memory(maren_memory::MemoryError::Store(e)) => e.kind(),
            Self::Broker(_) | Self::Fatal(_) => ErrorKind::Fatal,
            Self::AlreadyRunning => ErrorKind::Conflict,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        }
    }
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
