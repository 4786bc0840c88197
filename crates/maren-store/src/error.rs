//! Store error types.

use maren_core::ErrorKind;
use thiserror::Error;

/// Errors raised by the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not open or migrate the database.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The operation exceeded the store timeout.
    #[error("store operation timed out")]
    Timeout,

    /// A uniqueness constraint fired; the entity already exists.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A compare-and-set update lost the race (wrong state or stale value).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller input violated an entity invariant.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A JSON column could not be (de)serialized.
    #[error("column codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Any other database error.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

impl StoreError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::TransientExternal,
            Self::Duplicate(_) => ErrorKind::DuplicateIngest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Invalid(_) => ErrorKind::Validation,
            Self::Connection(_) | Self::Codec(_) | Self::Query(_) => ErrorKind::Fatal,
        }
    }

    /// Map a unique-constraint failure onto [`StoreError::Duplicate`].
    pub(crate) fn from_insert(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            if db.is_unique_violation() {
                return Self::Duplicate(what.to_owned());
            }
        }
        Self::Query(err)
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
