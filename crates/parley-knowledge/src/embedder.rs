//! Text embeddings.
//!
//! The [`Embedder`] contract: fixed output dimension, rows unit-normalized,
//! deterministic for a given input.  The shipped [`HashEmbedder`] derives a
//! vector from the SHA-256 digest of the text -- deterministic and cheap, but
//! with no semantic notion of similarity.  It exists for test determinism
//! and offline operation; production deployments substitute a real model
//! behind the same trait.

use ring::digest::{SHA256, digest};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Produces fixed-dimension, unit-norm embeddings.
pub trait Embedder: Send + Sync {
    /// Output dimension of every embedding.
    fn dimension(&self) -> usize;

    /// Embed one text.  The returned vector has exactly `dimension()`
    /// components and unit L2 norm.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Embed a batch; row `i` corresponds to `texts[i]`.
    fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

// ---------------------------------------------------------------------------
// Hash-derived placeholder
// ---------------------------------------------------------------------------

/// Default embedding dimension.
pub const DEFAULT_DIMENSION: usize = 384;

/// SHA-256-derived embedding.
///
/// The 32 digest bytes are tiled out to the configured dimension, converted
/// to floats, and unit-normalized.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let hash = digest(&SHA256, text.as_bytes());
        let bytes = hash.as_ref();

        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|i| bytes[i % bytes.len()] as f32)
            .collect();

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}
