//! Process-wide service wiring.
//!
//! One [`Services`] record is constructed at startup and passed by
//! reference; nothing in the request path reaches for globals.  Tests build
//! private copies over mocks via [`Services::new`]; production uses
//! [`Services::initialize`], which spawns the configured tool servers,
//! opens the index, and wires the HTTP LLM client.  Callers own exactly one
//! instance and call [`Services::shutdown`] on the way out, which kills the
//! tool-server subprocesses (the index persists on every write, so there is
//! nothing left to flush).

use std::sync::Arc;

use tracing::{error, info, warn};

use parley_kernel::{
    DEFAULT_MAX_IN_FLIGHT, ToolInvoker, ToolRegistry, ToolServerHandle,
};
use parley_knowledge::{
    CitationGraph, Chunker, DocumentParser, Embedder, HashEmbedder, IngestionConfig,
    KnowledgeIngestion, RetrievalService, VectorIndex,
};
use parley_store::{InMemoryThreadStore, ThreadStore};

use crate::chat::ChatService;
use crate::config::ParleyConfig;
use crate::error::Result;
use crate::llm::{HttpLlmClient, HttpLlmConfig, LlmClient};
use crate::orchestrator::Orchestrator;

/// The explicit dependency record for one running system.
pub struct Services {
    pub llm: Arc<dyn LlmClient>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub store: Arc<dyn ThreadStore>,
    pub retrieval: Arc<RetrievalService>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<VectorIndex>,
    pub graph: CitationGraph,
    registry: Option<ToolRegistry>,
}

impl Services {
    /// Assemble services from pre-built parts.  Used by tests and by
    /// embedders that bring their own LLM client or store.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        invoker: Arc<dyn ToolInvoker>,
        store: Arc<dyn ThreadStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        graph: CitationGraph,
    ) -> Self {
        let retrieval = Arc::new(RetrievalService::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            graph.clone(),
        ));
        Self {
            llm,
            invoker,
            store,
            retrieval,
            embedder,
            index,
            graph,
            registry: None,
        }
    }

    /// Bring the whole system up from configuration: LLM client, tool
    /// servers, vector index, citation graph, thread store.
    ///
    /// Tool servers that fail to spawn or fail discovery are logged and
    /// left disabled; the system serves requests without them.
    pub async fn initialize(config: &ParleyConfig) -> Result<Self> {
        let api_key = config.api_key().unwrap_or_default();
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(HttpLlmConfig {
            api_key,
            base_url: config.llm.base_url.clone(),
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        })?);
        info!(model = %config.llm.model, "llm client ready");

        let registry = ToolRegistry::new(config.tool_deadline());
        for (server_id, command) in config.enabled_servers() {
            match ToolServerHandle::spawn(server_id.as_str(), &command, DEFAULT_MAX_IN_FLIGHT) {
                Ok(handle) => {
                    if let Err(e) = registry.register(server_id.as_str(), handle).await {
                        warn!(server = %server_id, error = %e, "server registration failed");
                    }
                }
                Err(e) => {
                    warn!(server = %server_id, error = %e, "server spawn failed; continuing without it");
                }
            }
        }

        let embedder: Arc<dyn Embedder> =
            Arc::new(HashEmbedder::new(config.knowledge.embedding_dim));
        let index = Arc::new(
            VectorIndex::open(&config.knowledge.index_dir, config.knowledge.embedding_dim)
                .await?,
        );
        let graph = match &config.knowledge.citation_graph_db {
            Some(path) => CitationGraph::open(path).unwrap_or_else(|e| {
                error!(path = %path.display(), error = %e, "citation graph unavailable; disabling");
                CitationGraph::disabled()
            }),
            None => CitationGraph::disabled(),
        };
        let retrieval = Arc::new(RetrievalService::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            graph.clone(),
        ));
        let store: Arc<dyn ThreadStore> = Arc::new(InMemoryThreadStore::new());

        info!(
            servers = registry.connected_servers().len(),
            graph = graph.is_enabled(),
            "services initialized"
        );
        Ok(Self {
            llm,
            invoker: Arc::new(registry.clone()),
            store,
            retrieval,
            embedder,
            index,
            graph,
            registry: Some(registry),
        })
    }

    /// Build the chat facade over these services.
    pub fn chat_service(&self, config: &ParleyConfig) -> ChatService {
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.llm),
            Arc::clone(&self.invoker),
            Arc::clone(&self.retrieval),
            config.orchestrator_config(),
        );
        ChatService::new(Arc::clone(&self.store), Arc::new(orchestrator))
    }

    /// Build the batch ingestion pipeline over these services.
    pub fn ingestion(&self, config: &ParleyConfig) -> Result<KnowledgeIngestion> {
        let chunker = Chunker::new(config.knowledge.chunk_size, config.knowledge.chunk_overlap)?;
        Ok(KnowledgeIngestion::new(
            DocumentParser::new(),
            chunker,
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.graph.clone(),
            IngestionConfig {
                runs_dir: config.knowledge.runs_dir.clone(),
                ignore_names: config.knowledge.ignore_names.clone(),
            },
        ))
    }

    /// Kill tool-server subprocesses.  Safe to call when none were spawned.
    pub async fn shutdown(&self) {
        if let Some(registry) = &self.registry {
            registry.shutdown().await;
        }
        info!("services shut down");
    }
}
