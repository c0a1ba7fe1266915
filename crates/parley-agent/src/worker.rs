//! Workers.
//!
//! A worker turns one [`WorkerTask`] into exactly one [`TaskResult`].  All
//! internal failures -- LLM errors, tool errors, bad plans -- are captured as
//! `success = false` results; nothing propagates as an error past the
//! worker boundary, so sibling tasks always keep running.
//!
//! Two kinds exist: the conversational worker answers with the LLM, and the
//! tool worker drives a tool server through a short structured tool-use
//! loop over a whitelisted subset of its tools.  Tasks whose plan marks
//! them `needs_approval` are not executed; the tool worker emits a
//! [`PendingApproval`] record and a `requires_approval` result instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use parley_kernel::ToolInvoker;

use crate::llm::{LlmClient, Message};
use crate::plan::{WorkerKind, WorkerTask};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The single result a worker produces for a task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: u32,
    pub worker_kind: WorkerKind,
    pub success: bool,
    pub output: String,
    pub used_context: bool,
    pub error: Option<String>,
    /// `server.tool` names actually invoked for this task.
    pub tools_used: Vec<String>,
    /// Set when the task was withheld pending human approval.
    pub requires_approval: bool,
}

impl TaskResult {
    fn failure(task: &WorkerTask, used_context: bool, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            task_id: task.id,
            worker_kind: task.worker_kind,
            success: false,
            output: error.clone(),
            used_context,
            error: Some(error),
            tools_used: Vec::new(),
            requires_approval: false,
        }
    }
}

/// A write operation held back for human sign-off.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingApproval {
    pub task_id: u32,
    pub server: String,
    pub tool: String,
    pub arguments: Value,
    pub preview: String,
}

// ---------------------------------------------------------------------------
// Conversational worker
// ---------------------------------------------------------------------------

/// Answers a task with the LLM, optionally grounded in gathered context.
#[derive(Clone)]
pub struct ConversationalWorker {
    llm: Arc<dyn LlmClient>,
}

impl ConversationalWorker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn execute(
        &self,
        task: &WorkerTask,
        user_query: &str,
        context: Option<&str>,
    ) -> TaskResult {
        let instruction = if task.description.is_empty() {
            "Respond conversationally"
        } else {
            &task.description
        };

        let prompt = match context {
            Some(context) => format!(
                "User query: {user_query}\n\n\
                 Context from search:\n{context}\n\n\
                 Task: {instruction}\n\n\
                 Respond using this context where it helps; ignore it when it \
                 is not relevant."
            ),
            None => format!(
                "User query: {user_query}\n\n\
                 Task: {instruction}\n\n\
                 Provide a helpful, conversational response."
            ),
        };

        let messages = [
            Message::system("You are a helpful assistant."),
            Message::user(prompt),
        ];
        match self.llm.complete(&messages).await {
            Ok(output) => {
                debug!(task_id = task.id, "conversational task completed");
                TaskResult {
                    task_id: task.id,
                    worker_kind: task.worker_kind,
                    success: true,
                    output,
                    used_context: context.is_some(),
                    error: None,
                    tools_used: Vec::new(),
                    requires_approval: false,
                }
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "conversational task failed");
                TaskResult::failure(task, context.is_some(), format!("LLM call failed: {e}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tool worker
// ---------------------------------------------------------------------------

/// GitHub tools the worker is willing to expose to the model.
const GITHUB_WHITELIST: &[&str] = &[
    "create_repository",
    "get_file_contents",
    "create_or_update_file",
    "create_pull_request",
    "list_pull_requests",
    "update_pull_request",
    "search_repositories",
    "get_me",
];

/// One step of the structured tool-use loop.
#[derive(Debug, Deserialize)]
struct ToolAction {
    action: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    response: Option<String>,
}

fn tool_action_schema() -> Value {
    json!({
        "type": "object",
        "required": ["action"],
        "properties": {
            "action": {"enum": ["call_tool", "finish"]},
            "tool": {"type": ["string", "null"]},
            "arguments": {"type": "object"},
            "response": {"type": ["string", "null"]}
        }
    })
}

/// Drives tool servers on behalf of tool tasks.
#[derive(Clone)]
pub struct ToolWorker {
    llm: Arc<dyn LlmClient>,
    invoker: Arc<dyn ToolInvoker>,
    whitelists: Arc<HashMap<String, Vec<String>>>,
    max_turns: usize,
}

impl ToolWorker {
    /// Default cap on tool-use loop turns.
    pub const DEFAULT_MAX_TURNS: usize = 3;

    pub fn new(llm: Arc<dyn LlmClient>, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            llm,
            invoker,
            whitelists: Arc::new(Self::default_whitelists()),
            max_turns: Self::DEFAULT_MAX_TURNS,
        }
    }

    /// Per-server tool whitelists; servers without an entry expose all of
    /// their discovered tools.
    pub fn default_whitelists() -> HashMap<String, Vec<String>> {
        let mut map = HashMap::new();
        map.insert(
            "github".to_owned(),
            GITHUB_WHITELIST.iter().map(|s| (*s).to_owned()).collect(),
        );
        map
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    /// Execute a tool task.  Also returns any approval records the task
    /// generated instead of side effects.
    pub async fn execute(
        &self,
        task: &WorkerTask,
        user_query: &str,
        context: Option<&str>,
    ) -> (TaskResult, Vec<PendingApproval>) {
        let used_context = context.is_some();
        let Some(spec) = &task.tool_spec else {
            return (
                TaskResult::failure(task, used_context, "tool task has no tool_spec"),
                Vec::new(),
            );
        };

        if task.needs_approval {
            let approval = PendingApproval {
                task_id: task.id,
                server: spec.server.clone(),
                tool: spec.tool.clone().unwrap_or_else(|| "unspecified".to_owned()),
                arguments: spec.arguments.clone(),
                preview: format!("{}: {}", spec.server, task.title),
            };
            info!(task_id = task.id, server = %spec.server, "task held for approval");
            let result = TaskResult {
                task_id: task.id,
                worker_kind: task.worker_kind,
                success: true,
                output: format!(
                    "This action needs your approval before it runs: {}.",
                    task.title
                ),
                used_context,
                error: None,
                tools_used: Vec::new(),
                requires_approval: true,
            };
            return (result, vec![approval]);
        }

        // A concrete tool in the plan short-circuits the selection loop.
        if let Some(tool) = &spec.tool {
            let arguments = if spec.arguments.is_object() {
                spec.arguments.clone()
            } else {
                json!({})
            };
            return (
                self.direct_call(task, spec.server.as_str(), tool, arguments, used_context)
                    .await,
                Vec::new(),
            );
        }

        (
            self.tool_loop(task, spec.server.as_str(), user_query, context)
                .await,
            Vec::new(),
        )
    }

    async fn direct_call(
        &self,
        task: &WorkerTask,
        server: &str,
        tool: &str,
        arguments: Value,
        used_context: bool,
    ) -> TaskResult {
        match self.invoker.invoke(server, tool, arguments).await {
            Ok(value) => TaskResult {
                task_id: task.id,
                worker_kind: task.worker_kind,
                success: true,
                output: format!("{server}.{tool} returned: {value}"),
                used_context,
                error: None,
                tools_used: vec![format!("{server}.{tool}")],
                requires_approval: false,
            },
            Err(e) => {
                warn!(task_id = task.id, server, tool, error = %e, "direct tool call failed");
                TaskResult::failure(task, used_context, format!("{server}.{tool} failed: {e}"))
            }
        }
    }

    async fn tool_loop(
        &self,
        task: &WorkerTask,
        server: &str,
        user_query: &str,
        context: Option<&str>,
    ) -> TaskResult {
        let used_context = context.is_some();

        let tools = self.allowed_tools(server);
        if tools.is_empty() {
            return TaskResult::failure(
                task,
                used_context,
                format!("no tools available for server `{server}`"),
            );
        }

        let tool_listing = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n");
        let allowed: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

        let mut messages = vec![
            Message::system(format!(
                "You complete tasks by calling tools on the `{server}` server.\n\
                 Available tools:\n{tool_listing}\n\n\
                 Respond with JSON: either\n\
                 {{\"action\": \"call_tool\", \"tool\": \"<name>\", \"arguments\": {{...}}}}\n\
                 to invoke a tool, or\n\
                 {{\"action\": \"finish\", \"response\": \"<answer for the user>\"}}\n\
                 once the task is done."
            )),
            Message::user(build_task_prompt(task, user_query, context)),
        ];

        let mut tools_used = Vec::new();
        let mut last_output = String::new();

        for turn in 0..self.max_turns {
            let action = match self
                .llm
                .complete_structured(&messages, &tool_action_schema())
                .await
                .and_then(|v| {
                    serde_json::from_value::<ToolAction>(v).map_err(|e| {
                        crate::error::AgentError::LlmParseFailed {
                            reason: e.to_string(),
                        }
                    })
                }) {
                Ok(action) => action,
                Err(e) => {
                    warn!(task_id = task.id, turn, error = %e, "tool loop step failed");
                    if tools_used.is_empty() {
                        return TaskResult::failure(
                            task,
                            used_context,
                            format!("tool selection failed: {e}"),
                        );
                    }
                    break;
                }
            };

            if action.action == "finish" {
                let output = action
                    .response
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| last_output.clone());
                return TaskResult {
                    task_id: task.id,
                    worker_kind: task.worker_kind,
                    success: true,
                    output,
                    used_context,
                    error: None,
                    tools_used,
                    requires_approval: false,
                };
            }

            let Some(tool) = action.tool.as_deref() else {
                messages.push(Message::user(
                    "That call_tool action named no tool. Pick one of the listed tools."
                        .to_owned(),
                ));
                continue;
            };
            if !allowed.contains(&tool) {
                messages.push(Message::user(format!(
                    "Tool `{tool}` is not available. Pick one of the listed tools."
                )));
                continue;
            }

            let arguments = if action.arguments.is_object() {
                action.arguments.clone()
            } else {
                json!({})
            };
            messages.push(Message::assistant(
                json!({"action": "call_tool", "tool": tool, "arguments": arguments}).to_string(),
            ));

            match self.invoker.invoke(server, tool, arguments).await {
                Ok(value) => {
                    debug!(task_id = task.id, server, tool, "tool call succeeded");
                    tools_used.push(format!("{server}.{tool}"));
                    last_output = value.to_string();
                    messages.push(Message::user(format!("Tool `{tool}` returned: {value}")));
                }
                Err(e) => {
                    warn!(task_id = task.id, server, tool, error = %e, "tool call failed");
                    messages.push(Message::user(format!(
                        "Tool `{tool}` failed: {e}. Recover or finish."
                    )));
                }
            }
        }

        // Turn budget exhausted; wrap up with whatever the tools produced.
        messages.push(Message::user(
            "Stop calling tools. Summarize the outcome for the user.".to_owned(),
        ));
        let output = match self.llm.complete(&messages).await {
            Ok(summary) => summary,
            Err(_) if !last_output.is_empty() => last_output,
            Err(e) => {
                return TaskResult::failure(
                    task,
                    used_context,
                    format!("tool loop did not produce a result: {e}"),
                );
            }
        };
        TaskResult {
            task_id: task.id,
            worker_kind: task.worker_kind,
            success: true,
            output,
            used_context,
            error: None,
            tools_used,
            requires_approval: false,
        }
    }

    fn allowed_tools(&self, server: &str) -> Vec<parley_kernel::ToolDescriptor> {
        let discovered = self.invoker.server_tools(server);
        match self.whitelists.get(server) {
            Some(whitelist) => discovered
                .into_iter()
                .filter(|t| whitelist.iter().any(|w| w == &t.name))
                .collect(),
            None => discovered,
        }
    }
}

fn build_task_prompt(task: &WorkerTask, user_query: &str, context: Option<&str>) -> String {
    let mut prompt = format!("Task: {}\n", task.title);
    if !task.description.is_empty() {
        prompt.push_str(&format!("Details: {}\n", task.description));
    }
    prompt.push_str(&format!("Original query: {user_query}\n"));
    if let Some(context) = context {
        let snippet: String = context.chars().take(800).collect();
        prompt.push_str(&format!(
            "\nContext from search (use if relevant):\n{snippet}\n"
        ));
    }
    prompt
}
