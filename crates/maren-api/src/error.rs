//! API error envelope.
//!
//! Every error renders as `{"error": {"code", "message"}}` with the status
//! implied by its kind: 400 validation, 401 auth, 404 not found, 409
//! conflict, 429 rate limited, 503 overloaded/circuit-open, 500 otherwise.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use maren_core::ErrorKind;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// API-surface errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request payload or parameters.
    #[error("{0}")]
    Validation(String),

    /// Missing or wrong bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// Unknown entity.
    #[error("{0}")]
    NotFound(String),

    /// Optimistic-concurrency loss (already claimed, already processed).
    #[error("{0}")]
    Conflict(String),

    /// Per-IP budget exceeded.
    #[error("rate limited")]
    RateLimited,

    /// A queue is above its hard-stop watermark.
    #[error("service overloaded: {0}")]
    Overloaded(String),

    /// Recovery circuit breaker open.
    #[error("recovery unavailable, retry in {retry_after_secs}s")]
    CircuitOpen {
        /// Seconds until the breaker closes.
        retry_after_secs: u64,
    },

    /// Anything else.
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Overloaded(_) | Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited => "rate_limited",
            Self::Overloaded(_) => "overloaded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!(detail, "internal API error");
        }
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        let mut response = (self.status(), body).into_response();
        if let Self::CircuitOpen { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<maren_store::StoreError> for ApiError {
    fn from(err: maren_store::StoreError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(err.to_string()),
            ErrorKind::Conflict | ErrorKind::DuplicateIngest => Self::Conflict(err.to_string()),
            ErrorKind::Validation => Self::Validation(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<maren_pipeline::PipelineError> for ApiError {
    fn from(err: maren_pipeline::PipelineError) -> Self {
        match &err {
            maren_pipeline::PipelineError::AlreadyRunning => Self::Conflict(err.to_string()),
            maren_pipeline::PipelineError::CircuitOpen { retry_after_secs } => Self::CircuitOpen {
                retry_after_secs: *retry_after_secs,
            },
            _ => match err.kind() {
                ErrorKind::NotFound => Self::NotFound(err.to_string()),
                ErrorKind::Conflict => Self::Conflict(err.to_string()),
                ErrorKind::Validation => Self::Validation(err.to_string()),
                _ => Self::Internal(err.to_string()),
            },
        }
    }
}

impl From<maren_broker::BrokerError> for ApiError {
    fn from(err: maren_broker::BrokerError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<maren_llm::LlmError> for ApiError {
    fn from(err: maren_llm::LlmError) -> Self {
        match err {
            maren_llm::LlmError::UnknownProfile(name) => {
                Self::Validation(format!("unknown profile: {name}"))
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;
