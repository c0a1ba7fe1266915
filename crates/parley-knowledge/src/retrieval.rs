//! Retrieval service.
//!
//! Wraps the embedder, the vector index, and the optional citation graph
//! into a single `retrieve` call: embed the query once, search top-k, then
//! (on request) attach citation neighborhoods for the distinct documents in
//! the result set.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::graph::{CitationGraph, CitationNeighborhood};
use crate::index::{MetadataFilter, VectorIndex};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One retrieved chunk with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    pub metadata: Value,
    pub document_id: String,
}

/// The full response of a retrieval call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub query: String,
    pub chunks: Vec<RetrievedChunk>,
    /// Citation neighborhoods keyed by document id; present only when
    /// requested and the graph backend is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<BTreeMap<String, CitationNeighborhood>>,
}

/// A document known to the index, with a human-readable label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub document_id: String,
    pub label: String,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Embed-and-search facade over the knowledge stores.
#[derive(Clone)]
pub struct RetrievalService {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    graph: CitationGraph,
}

impl RetrievalService {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>, graph: CitationGraph) -> Self {
        Self {
            embedder,
            index,
            graph,
        }
    }

    /// Top-`k` chunks for `query`, optionally with citation neighborhoods.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        include_citations: bool,
    ) -> Result<RetrievalResponse> {
        let chunks = self.retrieve_filtered(query, k, None).await?;

        let citations = if include_citations && self.graph.is_enabled() {
            let documents: HashSet<&str> =
                chunks.iter().map(|c| c.document_id.as_str()).collect();
            let mut map = BTreeMap::new();
            for document_id in documents {
                map.insert(
                    document_id.to_owned(),
                    self.graph.neighbors(document_id).await?,
                );
            }
            Some(map)
        } else {
            None
        };

        Ok(RetrievalResponse {
            query: query.to_owned(),
            chunks,
            citations,
        })
    }

    /// Top-`k` chunks for `query` under an optional metadata filter.
    pub async fn retrieve_filtered(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedChunk>> {
        let embedding = self.embedder.embed(query);
        let hits = self.index.search(&embedding, k, filter).await?;
        debug!(query, k, results = hits.len(), "retrieval search completed");

        Ok(hits
            .into_iter()
            .map(|h| RetrievedChunk {
                text: h.chunk.text,
                score: h.score,
                metadata: h.chunk.metadata,
                document_id: h.document_id,
            })
            .collect())
    }

    /// Every indexed document with a label derived from its first chunk.
    pub async fn list_resources(&self) -> Vec<ResourceEntry> {
        let mut out = Vec::new();
        for document_id in self.index.list_documents().await {
            let label = self
                .index
                .first_chunk_metadata(&document_id)
                .await
                .and_then(|m| m.get("filename").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| document_id.clone());
            out.push(ResourceEntry { document_id, label });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;
    use crate::embedder::HashEmbedder;
    use serde_json::json;

    async fn service_with(
        docs: &[(&str, &[&str])],
        graph: CitationGraph,
    ) -> (RetrievalService, Arc<VectorIndex>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(HashEmbedder::new(64));
        let index = Arc::new(VectorIndex::open(dir.path(), 64).await.unwrap());

        for (document_id, texts) in docs {
            let chunks: Vec<Chunk> = texts
                .iter()
                .map(|t| Chunk {
                    text: (*t).to_owned(),
                    start_char: 0,
                    end_char: t.chars().count(),
                    metadata: json!({"filename": format!("{document_id}.txt")}),
                })
                .collect();
            let embeddings: Vec<Vec<f32>> =
                chunks.iter().map(|c| embedder.embed(&c.text)).collect();
            index.add(embeddings, chunks, document_id).await.unwrap();
        }

        let service = RetrievalService::new(embedder, Arc::clone(&index), graph);
        (service, index, dir)
    }

    #[tokio::test]
    async fn exact_text_query_ranks_its_chunk_first() {
        let (service, _index, _dir) = service_with(
            &[
                ("doc-a", &["the pid controller tunes gains"]),
                ("doc-b", &["unrelated chatter about lunch"]),
            ],
            CitationGraph::disabled(),
        )
        .await;

        // The hash embedder maps identical text to identical vectors, so an
        // exact-text query has distance zero to its own chunk.
        let response = service
            .retrieve("the pid controller tunes gains", 2, false)
            .await
            .unwrap();
        assert_eq!(response.chunks[0].document_id, "doc-a");
        assert!((response.chunks[0].score - 1.0).abs() < 1e-6);
        assert!(response.citations.is_none());
    }

    #[tokio::test]
    async fn citations_attach_per_document_when_enabled() {
        let graph = CitationGraph::open_in_memory().unwrap();
        graph.add_paper("doc-a", Some("A"), &json!({})).await.unwrap();
        graph.add_paper("doc-z", Some("Z"), &json!({})).await.unwrap();
        graph.add_citation("doc-a", "doc-z").await.unwrap();

        let (service, _index, _dir) =
            service_with(&[("doc-a", &["alpha text"])], graph).await;

        let response = service.retrieve("alpha text", 1, true).await.unwrap();
        let citations = response.citations.unwrap();
        assert_eq!(citations["doc-a"].cites[0].id, "doc-z");
    }

    #[tokio::test]
    async fn disabled_graph_omits_citations_even_when_requested() {
        let (service, _index, _dir) =
            service_with(&[("doc-a", &["alpha text"])], CitationGraph::disabled()).await;
        let response = service.retrieve("alpha text", 1, true).await.unwrap();
        assert!(response.citations.is_none());
    }

    #[tokio::test]
    async fn resources_use_first_chunk_filename() {
        let (service, _index, _dir) = service_with(
            &[("doc-a", &["one", "two"]), ("doc-b", &["three"])],
            CitationGraph::disabled(),
        )
        .await;

        let resources = service.list_resources().await;
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].document_id, "doc-a");
        assert_eq!(resources[0].label, "doc-a.txt");
    }
}
