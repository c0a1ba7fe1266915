//! Agent core for Parley.
//!
//! This crate implements the orchestration engine of the chat backend: the
//! machinery that takes a user query, decides which information sources and
//! actions it needs, fans the work out, and fuses the results into a single
//! reply.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────┐   ┌──────────────────┐   ┌─────────┐
//! │ SafetyGate │──>│ Planner │──>│ ContextProviders │──>│ Workers │
//! │ (patterns) │   │  (LLM)  │   │ web/rag/club/mix │   │ fan-out │
//! └────────────┘   └────┬────┘   └──────────────────┘   └────┬────┘
//!                       │ retry ▲                            │
//!                  ┌────┴───────┴───┐               ┌────────┴───┐
//!                  │ ConfidenceLoop │<──────────────│ Aggregator │
//!                  └────────────────┘               └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- the thin LLM client contract and the OpenAI-compatible HTTP
//!   implementation.
//! - [`plan`] / [`planner`] -- tagged execution plans and the LLM-backed
//!   intent classifier with its deterministic fallback.
//! - [`safety`] -- the pattern + soft-keyword + LLM red-flag gate.
//! - [`context`] -- the web / rag / club / mixed context providers.
//! - [`worker`] -- conversational and tool workers; every task yields one
//!   `TaskResult`, failures included.
//! - [`aggregate`] -- task-id-ordered result fusion.
//! - [`orchestrator`] -- the state machine tying it all together.
//! - [`chat`] -- the per-thread facade consumed by the HTTP layer.
//! - [`config`] / [`services`] -- configuration and explicit startup wiring.

pub mod aggregate;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod plan;
pub mod planner;
pub mod orchestrator;
pub mod safety;
pub mod services;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the most commonly used types at the crate root.
pub use aggregate::Aggregator;
pub use chat::{ChatReply, ChatService, StreamEvent};
pub use config::ParleyConfig;
pub use context::{ContextItem, ContextProvider, ContextRouter, ContextSource, GatheredContext};
pub use error::{AgentError, Result};
pub use llm::{HttpLlmClient, HttpLlmConfig, LlmClient, Message, Role};
pub use orchestrator::{OrchestrationOutcome, Orchestrator, OrchestratorConfig};
pub use plan::{ContextType, ExecutionPlan, ToolSpec, WorkerKind, WorkerTask};
pub use planner::{PlannedRequest, Planner};
pub use safety::{GateDecision, REFUSAL_MESSAGE, SafetyGate};
pub use services::Services;
pub use worker::{ConversationalWorker, PendingApproval, TaskResult, ToolWorker};
