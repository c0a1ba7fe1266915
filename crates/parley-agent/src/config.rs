//! Configuration.
//!
//! One [`ParleyConfig`] covers the whole system: LLM endpoint, per-server
//! enable flags and launch commands, knowledge-engine tuning, and the
//! orchestrator's budgets.  Loadable from a TOML file, with a small set of
//! environment overrides applied on top (a `.env` file is honored when
//! present).  API keys never live in the config file; only the name of the
//! environment variable holding them does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use parley_kernel::ServerCommand;

use crate::error::{AgentError, Result};
use crate::orchestrator::OrchestratorConfig;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// LLM endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Provider family; only `openai_compatible` is built in.
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "openai_compatible".to_owned(),
            model: "llama-3.3-70b-versatile".to_owned(),
            temperature: 0.1,
            max_tokens: 2_048,
            base_url: "https://api.groq.com/openai/v1".to_owned(),
            api_key_env: "PARLEY_LLM_API_KEY".to_owned(),
        }
    }
}

/// Tool-server enablement and launch commands.
///
/// Server ids are canonical: `gmail`, `drive`, `calendar`, `rag`, `web`,
/// `github`.  A flag without a matching entry in `commands` is logged and
/// skipped at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enable_gmail: bool,
    pub enable_drive: bool,
    pub enable_calendar: bool,
    pub enable_rag: bool,
    pub enable_web: bool,
    pub enable_github: bool,
    /// Launch command per canonical server id.
    pub commands: HashMap<String, ServerCommand>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enable_gmail: true,
            enable_drive: true,
            enable_calendar: true,
            enable_rag: true,
            enable_web: true,
            enable_github: true,
            commands: HashMap::new(),
        }
    }
}

/// Knowledge-engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_dim: usize,
    pub index_dir: PathBuf,
    /// Where ingestion run summaries go.
    pub runs_dir: PathBuf,
    /// SQLite path for the citation graph; absent means disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_graph_db: Option<PathBuf>,
    /// File names ingestion skips outright.
    pub ignore_names: Vec<String>,
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            embedding_dim: 384,
            index_dir: PathBuf::from("data/index"),
            runs_dir: PathBuf::from("data/ingestion"),
            citation_graph_db: None,
            ignore_names: vec![".DS_Store".to_owned(), "Thumbs.db".to_owned()],
        }
    }
}

/// Orchestrator budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub request_timeout_secs: u64,
    pub tool_deadline_secs: u64,
    pub confidence_threshold: f32,
    pub max_iterations: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            tool_deadline_secs: 30,
            confidence_threshold: 0.6,
            max_iterations: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// The whole system's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub llm: LlmSettings,
    pub servers: ServerSettings,
    pub knowledge: KnowledgeSettings,
    pub orchestrator: OrchestratorSettings,
}

impl ParleyConfig {
    /// Parse a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|e| AgentError::ConfigError {
            reason: format!("cannot parse {}: {e}", path.display()),
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("PARLEY_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(base_url) = std::env::var("PARLEY_LLM_BASE_URL") {
            self.llm.base_url = base_url;
        }
        if let Ok(dir) = std::env::var("PARLEY_INDEX_DIR") {
            self.knowledge.index_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("PARLEY_CITATION_GRAPH_DB") {
            self.knowledge.citation_graph_db = Some(PathBuf::from(path));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.knowledge.chunk_overlap >= self.knowledge.chunk_size / 2 {
            return Err(AgentError::ConfigError {
                reason: format!(
                    "chunk_overlap {} must be below half of chunk_size {}",
                    self.knowledge.chunk_overlap, self.knowledge.chunk_size
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.orchestrator.confidence_threshold) {
            return Err(AgentError::ConfigError {
                reason: "confidence_threshold must be within [0, 1]".to_owned(),
            });
        }
        Ok(())
    }

    /// The API key named by `llm.api_key_env`, if set in the environment.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.llm.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }

    /// Canonical `(id, command)` pairs for every enabled server that has a
    /// launch command configured.
    pub fn enabled_servers(&self) -> Vec<(String, ServerCommand)> {
        let flags = [
            ("gmail", self.servers.enable_gmail),
            ("drive", self.servers.enable_drive),
            ("calendar", self.servers.enable_calendar),
            ("rag", self.servers.enable_rag),
            ("web", self.servers.enable_web),
            ("github", self.servers.enable_github),
        ];
        let mut out = Vec::new();
        for (id, enabled) in flags {
            if !enabled {
                continue;
            }
            match self.servers.commands.get(id) {
                Some(command) => out.push((id.to_owned(), command.clone())),
                None => warn!(server = id, "server enabled but no launch command configured"),
            }
        }
        out
    }

    /// The orchestrator's runtime view of these settings.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            confidence_threshold: self.orchestrator.confidence_threshold,
            max_iterations: self.orchestrator.max_iterations,
            request_timeout: Duration::from_secs(self.orchestrator.request_timeout_secs),
        }
    }

    /// Per-call deadline for tool-server invocations.
    pub fn tool_deadline(&self) -> Duration {
        Duration::from_secs(self.orchestrator.tool_deadline_secs)
    }
}
