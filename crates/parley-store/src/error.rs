//! Store error types.

use uuid::Uuid;

/// Unified error type for the store crate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced thread does not exist (never created, or deleted).
    #[error("thread not found: {thread_id}")]
    ThreadNotFound { thread_id: Uuid },

    /// The thread exists but is closed to further appends.
    #[error("thread is closed: {thread_id}")]
    ThreadClosed { thread_id: Uuid },
}

/// Convenience alias used throughout the store crate.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
