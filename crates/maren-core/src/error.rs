//! Shared error taxonomy.
//!
//! Subsystem crates keep their own `thiserror` enums but classify every
//! error into one of these kinds. The API layer maps kinds onto HTTP
//! statuses; retry policies key off [`ErrorKind::is_transient`].

use thiserror::Error;

/// Abstract error kinds shared across the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Platform or provider timeout, 5xx, or rate limit. Retried with
    /// backoff at the call site; never corrupts state.
    TransientExternal,
    /// Every fallback model in the current profile is out of quota.
    QuotaExhausted,
    /// Bad caller input; no state change.
    Validation,
    /// Optimistic-concurrency failure (already claimed, cursor moved).
    Conflict,
    /// The (user, platform message id) pair was already ingested somewhere.
    DuplicateIngest,
    /// Entity does not exist.
    NotFound,
    /// Model output could not be parsed even after a repair pass.
    MalformedLlmOutput,
    /// The recovery circuit breaker is open.
    CircuitOpen,
    /// Unrecoverable: store unreachable, corrupt intake entry. Operator alert.
    Fatal,
}

impl ErrorKind {
    /// Whether callers should retry with backoff.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::TransientExternal)
    }

    /// Whether the caller raced another writer and may simply retry.
    #[must_use]
    pub const fn is_conflict(self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// Errors raised directly by core validation helpers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A bubble sequence violated its constraints.
    #[error("invalid bubbles: {0}")]
    InvalidBubbles(String),
}

impl CoreError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidBubbles(_) => ErrorKind::Validation,
        }
    }
}

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Maximum length of a single approved bubble.
pub const MAX_BUBBLE_CHARS: usize = 4096;

/// Maximum number of bubbles in an approval.
pub const MAX_BUBBLES: usize = 10;

/// Validate a reviewer-supplied bubble sequence.
///
/// # Errors
///
/// Returns [`CoreError::InvalidBubbles`] when the sequence is empty, a bubble
/// is empty, or a bubble exceeds [`MAX_BUBBLE_CHARS`] characters.
pub fn validate_bubbles(bubbles: &[String]) -> CoreResult<()> {
    if bubbles.is_empty() {
        return Err(CoreError::InvalidBubbles("empty bubble sequence".into()));
    }
    if bubbles.len() > MAX_BUBBLES {
        return Err(CoreError::InvalidBubbles(format!(
            "too many bubbles: {} > {MAX_BUBBLES}",
            bubbles.len()
        )));
    }
    for (i, bubble) in bubbles.iter().enumerate() {
        if bubble.trim().is_empty() {
            return Err(CoreError::InvalidBubbles(format!("bubble {i} is empty")));
        }
        if bubble.chars().count() > MAX_BUBBLE_CHARS {
            return Err(CoreError::InvalidBubbles(format!(
                "bubble {i} exceeds {MAX_BUBBLE_CHARS} chars"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ErrorKind::TransientExternal.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
        assert!(ErrorKind::Conflict.is_conflict());
    }

    #[test]
    fn test_validate_bubbles() {
        assert!(validate_bubbles(&[]).is_err());
        assert!(validate_bubbles(&["hey".into()]).is_ok());
        assert!(validate_bubbles(&[String::new()]).is_err());
        assert!(validate_bubbles(&["x".repeat(MAX_BUBBLE_CHARS + 1)]).is_err());
        let too_many: Vec<String> = (0..=MAX_BUBBLES).map(|i| format!("b{i}")).collect();
        assert!(validate_bubbles(&too_many).is_err());
    }
}
