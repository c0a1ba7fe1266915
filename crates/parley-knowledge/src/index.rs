//! Flat vector index with on-disk persistence.
//!
//! An exact L2 index over fixed-dimension vectors, a parallel array of chunk
//! records, and a parallel array of owning document ids.  Chunk ids are the
//! positions in these arrays; a document delete rebuilds the arrays and
//! renumbers, so chunk ids are only stable between mutations.
//!
//! Persistence lives in one directory: `vectors.bin` (binary: magic, dim,
//! count, then f32 little-endian rows) and `metadata.json` (chunk records
//! plus the chunk→document mapping).  Every mutation rewrites both files
//! via temp-file-then-rename.  If either file fails to decode at open time
//! the index falls back to empty with an error-level log line.
//!
//! Concurrency: single writer, many readers (`tokio::sync::RwLock`).
//! Readers during a delete/rebuild observe the pre- or post-rebuild state,
//! never a partial one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::chunker::Chunk;
use crate::error::{KnowledgeError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Stored form of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub metadata: Value,
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Position of the chunk in the index at the time of the search.
    pub chunk_id: usize,
    pub chunk: ChunkRecord,
    /// `1 / (1 + distance)`; higher is more similar.
    pub score: f32,
    /// L2 distance to the query.
    pub distance: f32,
    pub document_id: String,
}

/// Metadata-equality filter applied during search.
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    pub key: String,
    pub value: Value,
}

/// Index statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub n_chunks: usize,
    pub n_documents: usize,
    pub dim: usize,
    pub kind: String,
}

// ---------------------------------------------------------------------------
// Persistence formats
// ---------------------------------------------------------------------------

const VECTORS_FILE: &str = "vectors.bin";
const METADATA_FILE: &str = "metadata.json";
const VECTORS_MAGIC: &[u8; 8] = b"PARLEYV1";

/// Over-fetch factor when a metadata filter is in play.
const FILTER_OVERFETCH: usize = 3;

#[derive(Serialize, Deserialize)]
struct MetadataFileV1 {
    dim: usize,
    chunks: Vec<ChunkRecord>,
    documents: Vec<String>,
}

struct IndexState {
    vectors: Vec<Vec<f32>>,
    chunks: Vec<ChunkRecord>,
    documents: Vec<String>,
}

impl IndexState {
    fn empty() -> Self {
        Self {
            vectors: Vec::new(),
            chunks: Vec::new(),
            documents: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Exact flat L2 index with document-granular deletes.
pub struct VectorIndex {
    dir: PathBuf,
    dim: usize,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    /// Open the index in `dir`, loading any persisted state.
    ///
    /// Missing files produce an empty index; unreadable files produce an
    /// empty index and a loud log line (the corrupt files are left on disk
    /// until the next successful write replaces them).
    pub async fn open(dir: impl Into<PathBuf>, dim: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let state = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || load_state(&dir, dim)).await?
        };
        let state = match state {
            Ok(Some(state)) => {
                info!(
                    dir = %dir.display(),
                    chunks = state.chunks.len(),
                    "loaded vector index"
                );
                state
            }
            Ok(None) => {
                debug!(dir = %dir.display(), "no persisted index; starting empty");
                IndexState::empty()
            }
            Err(e) => {
                error!(
                    dir = %dir.display(),
                    error = %e,
                    "vector index store is corrupt; falling back to an empty index"
                );
                IndexState::empty()
            }
        };

        Ok(Self {
            dir,
            dim,
            state: RwLock::new(state),
        })
    }

    /// The configured embedding dimension.
    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Append chunks for `document_id` and persist.
    ///
    /// Returns the number of chunks added.  Fails with `DimMismatch` if any
    /// embedding's width differs from the index dimension; nothing is
    /// inserted in that case.
    pub async fn add(
        &self,
        embeddings: Vec<Vec<f32>>,
        chunks: Vec<Chunk>,
        document_id: &str,
    ) -> Result<usize> {
        if embeddings.len() != chunks.len() {
            return Err(KnowledgeError::CountMismatch {
                embeddings: embeddings.len(),
                chunks: chunks.len(),
            });
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dim) {
            return Err(KnowledgeError::DimMismatch {
                expected: self.dim,
                got: bad.len(),
            });
        }

        let count = chunks.len();
        let mut state = self.state.write().await;
        for (embedding, chunk) in embeddings.into_iter().zip(chunks) {
            state.vectors.push(embedding);
            state.chunks.push(ChunkRecord {
                text: chunk.text,
                start_char: chunk.start_char,
                end_char: chunk.end_char,
                metadata: chunk.metadata,
            });
            state.documents.push(document_id.to_owned());
        }
        self.persist(&state).await?;
        info!(document_id, count, total = state.chunks.len(), "chunks indexed");
        Ok(count)
    }

    /// Top-`k` nearest chunks by L2 distance, similarity-descending.
    ///
    /// With a filter, `3k` candidates are ranked first and filtered before
    /// truncation, matching the behavior retrieval quality depends on.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(KnowledgeError::DimMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }

        let state = self.state.read().await;
        if state.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let fetch = if filter.is_some() {
            (k * FILTER_OVERFETCH).min(state.vectors.len())
        } else {
            k.min(state.vectors.len())
        };

        let mut ranked: Vec<(usize, f32)> = state
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, l2_distance(query, v)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked.truncate(fetch);

        let mut hits = Vec::with_capacity(k);
        for (chunk_id, distance) in ranked {
            let record = &state.chunks[chunk_id];
            if let Some(f) = filter {
                if record.metadata.get(&f.key) != Some(&f.value) {
                    continue;
                }
            }
            hits.push(SearchHit {
                chunk_id,
                chunk: record.clone(),
                score: 1.0 / (1.0 + distance),
                distance,
                document_id: state.documents[chunk_id].clone(),
            });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }

    /// Remove every chunk of `document_id`, rebuild, persist.
    ///
    /// Returns the number of chunks removed.
    pub async fn delete(&self, document_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;

        let keep: Vec<usize> = (0..state.chunks.len())
            .filter(|&i| state.documents[i] != document_id)
            .collect();
        let removed = state.chunks.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut rebuilt = IndexState::empty();
        for i in keep {
            rebuilt.vectors.push(std::mem::take(&mut state.vectors[i]));
            rebuilt.chunks.push(state.chunks[i].clone());
            rebuilt.documents.push(state.documents[i].clone());
        }
        *state = rebuilt;

        self.persist(&state).await?;
        info!(document_id, removed, remaining = state.chunks.len(), "document deleted");
        Ok(removed)
    }

    /// Distinct document ids, in first-indexed order.
    pub async fn list_documents(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for doc in &state.documents {
            if seen.insert(doc.clone()) {
                out.push(doc.clone());
            }
        }
        out
    }

    /// Metadata of the first indexed chunk of `document_id`.
    pub async fn first_chunk_metadata(&self, document_id: &str) -> Option<Value> {
        let state = self.state.read().await;
        state
            .documents
            .iter()
            .position(|d| d == document_id)
            .map(|i| state.chunks[i].metadata.clone())
    }

    /// Current statistics.
    pub async fn stats(&self) -> IndexStats {
        let state = self.state.read().await;
        let n_documents = state.documents.iter().collect::<HashSet<_>>().len();
        IndexStats {
            n_chunks: state.chunks.len(),
            n_documents,
            dim: self.dim,
            kind: "flat_l2".to_owned(),
        }
    }

    /// Write both files, temp-then-rename, while the write lock is held so
    /// the on-disk state always matches some observed in-memory state.
    async fn persist(&self, state: &IndexState) -> Result<()> {
        let vectors = encode_vectors(self.dim, &state.vectors);
        let metadata = serde_json::to_vec(&MetadataFileV1 {
            dim: self.dim,
            chunks: state.chunks.clone(),
            documents: state.documents.clone(),
        })?;

        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            write_atomic(&dir.join(VECTORS_FILE), &vectors)?;
            write_atomic(&dir.join(METADATA_FILE), &metadata)?;
            Ok(())
        })
        .await?
    }
}

// ---------------------------------------------------------------------------
// Codec + file helpers
// ---------------------------------------------------------------------------

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn encode_vectors(dim: usize, vectors: &[Vec<f32>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + vectors.len() * dim * 4);
    out.extend_from_slice(VECTORS_MAGIC);
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.extend_from_slice(&(vectors.len() as u64).to_le_bytes());
    for vector in vectors {
        for v in vector {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

fn decode_vectors(bytes: &[u8], expected_dim: usize) -> Result<Vec<Vec<f32>>> {
    let corrupt = |reason: &str| KnowledgeError::CorruptStore {
        reason: reason.to_owned(),
    };

    if bytes.len() < 20 || &bytes[..8] != VECTORS_MAGIC {
        return Err(corrupt("bad magic in vectors file"));
    }
    let dim = u32::from_le_bytes(bytes[8..12].try_into().expect("sized slice")) as usize;
    let count = u64::from_le_bytes(bytes[12..20].try_into().expect("sized slice")) as usize;
    if dim != expected_dim {
        return Err(KnowledgeError::DimMismatch {
            expected: expected_dim,
            got: dim,
        });
    }
    let payload = &bytes[20..];
    if payload.len() != count * dim * 4 {
        return Err(corrupt("vectors file truncated"));
    }

    let mut vectors = Vec::with_capacity(count);
    for row in payload.chunks_exact(dim * 4) {
        vectors.push(
            row.chunks_exact(4)
                .map(|b| f32::from_le_bytes(b.try_into().expect("sized slice")))
                .collect(),
        );
    }
    Ok(vectors)
}

fn load_state(dir: &Path, dim: usize) -> Result<Option<IndexState>> {
    let vectors_path = dir.join(VECTORS_FILE);
    let metadata_path = dir.join(METADATA_FILE);
    if !vectors_path.exists() || !metadata_path.exists() {
        return Ok(None);
    }

    let vectors = decode_vectors(&std::fs::read(&vectors_path)?, dim)?;
    let metadata: MetadataFileV1 = serde_json::from_slice(&std::fs::read(&metadata_path)?)
        .map_err(|e| KnowledgeError::CorruptStore {
            reason: format!("metadata file: {e}"),
        })?;

    if metadata.chunks.len() != vectors.len() || metadata.documents.len() != vectors.len() {
        return Err(KnowledgeError::CorruptStore {
            reason: format!(
                "record count mismatch: {} vectors, {} chunks, {} document ids",
                vectors.len(),
                metadata.chunks.len(),
                metadata.documents.len()
            ),
        });
    }

    Ok(Some(IndexState {
        vectors,
        chunks: metadata.chunks,
        documents: metadata.documents,
    }))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
