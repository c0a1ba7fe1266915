//! Knowledge-engine error types.
//!
//! Parse failures are skipped and counted during ingestion, never fatal.
//! `DimMismatch` is a caller bug and surfaces as a failed ingestion step.
//! `CorruptStore` at open time triggers an empty-index fallback with an
//! error-level log line.

/// Unified error type for the knowledge crate.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    // -- Parsing -------------------------------------------------------------
    /// The file type is not one the parser understands.
    #[error("unsupported document type: {extension}")]
    UnsupportedFormat { extension: String },

    /// The bytes could not be decoded as the claimed format.
    #[error("corrupt document `{name}`: {reason}")]
    CorruptDocument { name: String, reason: String },

    // -- Index ---------------------------------------------------------------
    /// An embedding's width does not match the index dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },

    /// `add` was called with differing numbers of embeddings and chunks.
    #[error("embedding/chunk count mismatch: {embeddings} embeddings, {chunks} chunks")]
    CountMismatch { embeddings: usize, chunks: usize },

    /// The on-disk index files do not decode.
    #[error("corrupt index store: {reason}")]
    CorruptStore { reason: String },

    // -- Chunking ------------------------------------------------------------
    /// The chunker was configured with an unusable size/overlap pair.
    #[error("invalid chunking config: {reason}")]
    InvalidChunking { reason: String },

    // -- Upstream ------------------------------------------------------------
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("citation graph error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("blocking task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for KnowledgeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the knowledge crate.
pub type Result<T> = std::result::Result<T, KnowledgeError>;
