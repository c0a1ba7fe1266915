//! Batch knowledge ingestion.
//!
//! Walks a source directory tree, parses every supported file, chunks,
//! embeds, and upserts the vector index (and citation graph) under a stable
//! document id derived from the file's relative path.  Re-running ingestion
//! is idempotent at the document level: an id already present is deleted
//! first, then re-added.
//!
//! Each run writes a JSON summary under the runs directory plus a `latest`
//! alias.  Parse failures are skipped, counted, and reported in the summary;
//! they never abort the batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::chunker::Chunker;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::graph::CitationGraph;
use crate::index::VectorIndex;
use crate::parser::DocumentParser;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Settings for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Where run summaries are written.
    pub runs_dir: PathBuf,
    /// File names to skip outright (exact match).
    pub ignore_names: Vec<String>,
}

/// Per-document result within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub chunks: usize,
    /// Whether an earlier copy of this document was deleted first.
    pub replaced: bool,
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub timestamp: DateTime<Utc>,
    pub total_files: usize,
    pub ingested: usize,
    pub skipped: usize,
    pub total_chunks: usize,
    pub documents: Vec<DocumentOutcome>,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Walk → parse → chunk → embed → upsert pipeline.
pub struct KnowledgeIngestion {
    parser: DocumentParser,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    graph: CitationGraph,
    config: IngestionConfig,
}

impl KnowledgeIngestion {
    pub fn new(
        parser: DocumentParser,
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        graph: CitationGraph,
        config: IngestionConfig,
    ) -> Self {
        Self {
            parser,
            chunker,
            embedder,
            index,
            graph,
            config,
        }
    }

    /// Ingest every supported file under `source_dir`.
    pub async fn run(&self, source_dir: &Path) -> Result<IngestionReport> {
        info!(source = %source_dir.display(), "starting knowledge ingestion");

        let files = self.enumerate(source_dir).await?;
        let mut report = IngestionReport {
            timestamp: Utc::now(),
            total_files: files.len(),
            ingested: 0,
            skipped: 0,
            total_chunks: 0,
            documents: Vec::new(),
            errors: Vec::new(),
        };

        for path in files {
            let document_id = document_id_for(source_dir, &path);
            match self.ingest_file(source_dir, &path, &document_id).await {
                Ok(Some(outcome)) => {
                    report.ingested += 1;
                    report.total_chunks += outcome.chunks;
                    report.documents.push(outcome);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(document_id, error = %e, "skipping document");
                    report.skipped += 1;
                    report.errors.push(format!("{document_id}: {e}"));
                }
            }
        }

        self.write_report(&report).await?;
        info!(
            ingested = report.ingested,
            skipped = report.skipped,
            chunks = report.total_chunks,
            "knowledge ingestion finished"
        );
        Ok(report)
    }

    /// Files under `source_dir` with supported extensions, sorted for
    /// deterministic run summaries.
    async fn enumerate(&self, source_dir: &Path) -> Result<Vec<PathBuf>> {
        let source_dir = source_dir.to_path_buf();
        let supported: Vec<String> = self
            .parser
            .supported_extensions()
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let ignore_names = self.config.ignore_names.clone();

        let mut files = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in WalkBuilder::new(&source_dir).build().flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if ignore_names.iter().any(|i| i == &name) {
                    continue;
                }
                let extension = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                if supported.iter().any(|s| s == &extension) {
                    out.push(path.to_path_buf());
                }
            }
            out
        })
        .await?;

        files.sort();
        Ok(files)
    }

    async fn ingest_file(
        &self,
        source_dir: &Path,
        path: &Path,
        document_id: &str,
    ) -> Result<Option<DocumentOutcome>> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parsed = self.parser.parse(&bytes, &name)?;

        let metadata = document_metadata(source_dir, path, document_id, &name, &parsed.structured);
        let chunks = self.chunker.chunk(&parsed.text, &metadata);
        if chunks.is_empty() {
            return Ok(None);
        }

        // Delete-then-add keeps re-runs idempotent at the document level.
        let replaced = self.index.delete(document_id).await? > 0;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts);
        let count = self.index.add(embeddings, chunks, document_id).await?;

        self.graph
            .add_paper(document_id, Some(&name), &metadata)
            .await?;
        if let Some(cited) = metadata.get("cites").and_then(Value::as_array) {
            for target in cited.iter().filter_map(Value::as_str) {
                self.graph.add_citation(document_id, target).await?;
            }
        }

        Ok(Some(DocumentOutcome {
            document_id: document_id.to_owned(),
            chunks: count,
            replaced,
        }))
    }

    async fn write_report(&self, report: &IngestionReport) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.runs_dir).await?;
        let bytes = serde_json::to_vec_pretty(report)?;
        let stamped = self
            .config
            .runs_dir
            .join(format!("run-{}.json", report.timestamp.format("%Y%m%dT%H%M%S%3fZ")));
        tokio::fs::write(&stamped, &bytes).await?;
        tokio::fs::write(self.config.runs_dir.join("latest.json"), &bytes).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stable document id: the relative path with `/` separators.
fn document_id_for(source_dir: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(source_dir).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Chunk metadata for a document: id, filename, category (the first
/// directory component, mirroring the source tree layout), plus any
/// structured fields the parser surfaced.
fn document_metadata(
    source_dir: &Path,
    path: &Path,
    document_id: &str,
    name: &str,
    structured: &Option<Value>,
) -> Value {
    let mut metadata = json!({
        "document_id": document_id,
        "filename": name,
    });

    let rel = path.strip_prefix(source_dir).unwrap_or(path);
    let components: Vec<_> = rel.components().collect();
    if components.len() > 1 {
        metadata["category"] =
            Value::String(components[0].as_os_str().to_string_lossy().into_owned());
    }

    if let Some(Value::Object(fields)) = structured {
        let target = metadata.as_object_mut().expect("object literal");
        for (k, v) in fields {
            target.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    metadata
}
