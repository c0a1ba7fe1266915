//! Knowledge engine for Parley.
//!
//! The retrieval subsystem behind the assistant's knowledge providers:
//!
//! - **[`parser`]** -- file bytes → plain text (+ sections / structured data),
//!   dispatched by extension.
//! - **[`chunker`]** -- normalized text → bounded overlapping windows with
//!   sentence-preferred boundaries.
//! - **[`embedder`]** -- the embedding contract and the deterministic
//!   SHA-256-derived placeholder.
//! - **[`index`]** -- exact flat L2 vector index with document-granular
//!   deletes and temp-then-rename persistence.
//! - **[`graph`]** -- optional SQLite-backed citation graph; degrades to
//!   no-ops when unconfigured.
//! - **[`retrieval`]** -- embed-once, search, attach-citations facade.
//! - **[`ingest`]** -- the batch walk → parse → chunk → embed → upsert
//!   pipeline with idempotent re-runs.

pub mod chunker;
pub mod embedder;
pub mod error;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod parser;
pub mod retrieval;

// Re-export the most commonly used types at the crate root.
pub use chunker::{Chunk, Chunker};
pub use embedder::{DEFAULT_DIMENSION, Embedder, HashEmbedder};
pub use error::{KnowledgeError, Result};
pub use graph::{CitationGraph, CitationNeighborhood, PaperRef};
pub use index::{IndexStats, MetadataFilter, SearchHit, VectorIndex};
pub use ingest::{IngestionConfig, IngestionReport, KnowledgeIngestion};
pub use parser::{DocumentParser, PageExtractor, ParagraphExtractor, ParsedDocument};
pub use retrieval::{ResourceEntry, RetrievalResponse, RetrievalService, RetrievedChunk};
