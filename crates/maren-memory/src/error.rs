//! Memory error types.

use thiserror::Error;

/// Errors raised by the memory manager.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] maren_store::StoreError),
}

/// Result alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
