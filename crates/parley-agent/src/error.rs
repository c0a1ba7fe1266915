//! Agent error types.
//!
//! Worker-level failures are converted into `TaskResult { success: false }`
//! values at the worker boundary and never surface through this enum; what
//! remains here are LLM transport problems, configuration mistakes, and
//! errors propagated from the other Parley crates.

/// Unified error type for the agent crate.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- LLM errors ----------------------------------------------------------
    /// An HTTP request to the LLM provider failed.
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The LLM response could not be parsed into the expected format.
    #[error("llm response parse error: {reason}")]
    LlmParseFailed { reason: String },

    // -- Planning ------------------------------------------------------------
    /// The planner's structured output failed schema validation.  Handled
    /// internally by substituting the default plan; surfaced only in logs
    /// and orchestration metadata.
    #[error("malformed plan: {reason}")]
    MalformedPlan { reason: String },

    // -- Configuration -------------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] parley_kernel::KernelError),

    /// An error propagated from the knowledge crate.
    #[error("knowledge error: {0}")]
    Knowledge(#[from] parley_knowledge::KnowledgeError),

    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] parley_store::StoreError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmRequestFailed {
            reason: err.to_string(),
        }
    }
}
