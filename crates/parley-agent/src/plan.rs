//! Execution plans.
//!
//! The planner classifies a query into a closed set of intents: which
//! context sources to consult and which worker tasks to run.  These types
//! are the schema the LLM's structured output is validated against; they
//! are never persisted and live only for one orchestration run.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Context routing
// ---------------------------------------------------------------------------

/// Which context pipeline a plan routes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Web,
    Rag,
    Club,
    /// More than one source; each non-empty query list runs.
    Mixed,
    /// No context gathering at all.
    #[default]
    None,
}

/// The context source a single task wants attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskContextType {
    Web,
    Rag,
    Club,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// What kind of worker executes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Answer with the LLM directly.
    Conversational,
    /// Drive a tool server.
    Tool,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversational => write!(f, "conversational"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Which tool server (and optionally which tool) a tool task targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Canonical server id (`gmail`, `calendar`, `drive`, `github`, ...).
    pub server: String,
    /// A concrete tool to call; when absent the worker lets the LLM choose
    /// from the server's whitelisted tools.
    #[serde(default)]
    pub tool: Option<String>,
    /// Arguments for a concrete tool call.
    #[serde(default)]
    pub arguments: Value,
}

/// One unit of planned work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Unique within a plan; aggregation orders results by this id.
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub worker_kind: WorkerKind,
    #[serde(default)]
    pub tool_spec: Option<ToolSpec>,
    /// Whether the gathered context is attached to this task's prompt.
    #[serde(default)]
    pub requires_context: bool,
    #[serde(default)]
    pub context_type: Option<TaskContextType>,
    /// Writes that modify remote state wait for human approval.
    #[serde(default)]
    pub needs_approval: bool,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The planner's full output for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    #[serde(default)]
    pub needs_context: bool,
    #[serde(default)]
    pub context_type: ContextType,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub rag_queries: Vec<String>,
    #[serde(default)]
    pub club_queries: Vec<String>,
    pub tasks: Vec<WorkerTask>,
}

impl ExecutionPlan {
    /// The deterministic fallback used whenever the model's output does not
    /// validate: no context, one conversational task.
    pub fn default_conversational() -> Self {
        Self {
            needs_context: false,
            context_type: ContextType::None,
            reasoning: "fallback: default conversational plan".to_owned(),
            search_queries: Vec::new(),
            rag_queries: Vec::new(),
            club_queries: Vec::new(),
            tasks: vec![WorkerTask {
                id: 1,
                title: "Respond conversationally".to_owned(),
                description: "Respond to the user's message directly".to_owned(),
                worker_kind: WorkerKind::Conversational,
                tool_spec: None,
                requires_context: false,
                context_type: None,
                needs_approval: false,
            }],
        }
    }
}

/// JSON Schema the planner's structured output must satisfy.
pub fn execution_plan_schema() -> Value {
    json!({
        "type": "object",
        "required": ["reasoning", "tasks"],
        "properties": {
            "needs_context": {"type": "boolean"},
            "context_type": {"enum": ["web", "rag", "club", "mixed", "none"]},
            "reasoning": {"type": "string"},
            "search_queries": {"type": "array", "items": {"type": "string"}},
            "rag_queries": {"type": "array", "items": {"type": "string"}},
            "club_queries": {"type": "array", "items": {"type": "string"}},
            "tasks": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["id", "title", "worker_kind"],
                    "properties": {
                        "id": {"type": "integer", "minimum": 0},
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "worker_kind": {"enum": ["conversational", "tool"]},
                        "tool_spec": {
                            "type": ["object", "null"],
                            "required": ["server"],
                            "properties": {
                                "server": {"type": "string"},
                                "tool": {"type": ["string", "null"]},
                                "arguments": {"type": ["object", "null"]}
                            }
                        },
                        "requires_context": {"type": "boolean"},
                        "context_type": {"enum": ["web", "rag", "club", null]},
                        "needs_approval": {"type": "boolean"}
                    }
                }
            }
        }
    })
}
