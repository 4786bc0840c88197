//! LLM-related error types.

use maren_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur with LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// API key not configured.
    #[error("API key not configured for {provider}")]
    ApiKeyNotConfigured {
        /// Provider name.
        provider: String,
    },

    /// Timeout, connection failure, or provider 5xx. Retried with backoff.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Provider returned 429. Fails over immediately.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds the provider asked us to wait.
        retry_after_secs: u64,
    },

    /// The response could not be parsed into the expected shape.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// Every model in the chain is out of daily quota.
    #[error("daily quota exhausted across the fallback chain for {role}")]
    QuotaExhausted {
        /// The role whose chain is dry.
        role: String,
    },

    /// A role or profile referenced a model with no registered provider.
    #[error("no provider registered for model {model}")]
    UnknownModel {
        /// The unregistered model name.
        model: String,
    },

    /// Unknown profile name in a switch request.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// HTTP-level failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LlmError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientProvider(_) | Self::RateLimited { .. } | Self::Http(_) => {
                ErrorKind::TransientExternal
            },
            Self::QuotaExhausted { .. } => ErrorKind::QuotaExhausted,
            Self::MalformedResponse(_) => ErrorKind::MalformedLlmOutput,
            Self::ApiKeyNotConfigured { .. }
            | Self::UnknownModel { .. }
            | Self::UnknownProfile(_) => ErrorKind::Fatal,
        }
    }
}

/// Result type for LLM operations.
pub type LlmResult<T> = Result<T, LlmError>;
