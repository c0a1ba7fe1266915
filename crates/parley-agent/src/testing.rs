//! Shared test doubles for the agent crate's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use parley_kernel::{KernelError, ToolDescriptor, ToolInvoker};
use parley_knowledge::{CitationGraph, Chunk, HashEmbedder, RetrievalService, VectorIndex};

use crate::error::{AgentError, Result};
use crate::llm::{LlmClient, Message};

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

type CompleteFn = Box<dyn Fn(&[Message]) -> Result<String> + Send + Sync>;
type StructuredFn = Box<dyn Fn(&[Message], &Value) -> Result<Value> + Send + Sync>;

/// [`LlmClient`] driven by closures, with a call log.
pub struct MockLlm {
    on_complete: CompleteFn,
    on_structured: StructuredFn,
    pub complete_log: Mutex<Vec<String>>,
    pub structured_log: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn with_handlers(
        on_complete: impl Fn(&[Message]) -> Result<String> + Send + Sync + 'static,
        on_structured: impl Fn(&[Message], &Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_complete: Box::new(on_complete),
            on_structured: Box::new(on_structured),
            complete_log: Mutex::new(Vec::new()),
            structured_log: Mutex::new(Vec::new()),
        }
    }

    /// Every `complete` returns `text`; structured calls fail.
    pub fn completion(text: &str) -> Self {
        let text = text.to_owned();
        Self::with_handlers(
            move |_| Ok(text.clone()),
            |_, _| {
                Err(AgentError::LlmParseFailed {
                    reason: "no structured output scripted".to_owned(),
                })
            },
        )
    }

    /// Every `complete_structured` returns `value`; free-text calls return
    /// a fixed acknowledgement.
    pub fn structured(value: Value) -> Self {
        Self::with_handlers(
            |_| Ok("ok".to_owned()),
            move |_, _| Ok(value.clone()),
        )
    }

    /// Structured calls pop from `values` in order, then fail.
    pub fn structured_sequence(values: Vec<Value>) -> Self {
        let queue = Mutex::new(VecDeque::from(values));
        Self::with_handlers(
            |_| Ok("ok".to_owned()),
            move |_, _| {
                queue
                    .lock()
                    .expect("queue lock")
                    .pop_front()
                    .ok_or_else(|| AgentError::LlmParseFailed {
                        reason: "structured sequence exhausted".to_owned(),
                    })
            },
        )
    }

    /// Both calls fail, as if the provider were unreachable.
    pub fn failing() -> Self {
        Self::with_handlers(
            |_| {
                Err(AgentError::LlmRequestFailed {
                    reason: "scripted failure".to_owned(),
                })
            },
            |_, _| {
                Err(AgentError::LlmRequestFailed {
                    reason: "scripted failure".to_owned(),
                })
            },
        )
    }

    fn last_user(messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::llm::Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.complete_log
            .lock()
            .expect("log lock")
            .push(Self::last_user(messages));
        (self.on_complete)(messages)
    }

    async fn complete_structured(&self, messages: &[Message], schema: &Value) -> Result<Value> {
        self.structured_log
            .lock()
            .expect("log lock")
            .push(Self::last_user(messages));
        (self.on_structured)(messages, schema)
    }
}

// ---------------------------------------------------------------------------
// Scripted tool invoker
// ---------------------------------------------------------------------------

type ToolHandler = Box<dyn Fn(&Value) -> parley_kernel::Result<Value> + Send + Sync>;

/// [`ToolInvoker`] backed by per-tool closures, with a call log.
#[derive(Default)]
pub struct MockInvoker {
    tools: HashMap<(String, String), ToolHandler>,
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(
        mut self,
        server: &str,
        tool: &str,
        handler: impl Fn(&Value) -> parley_kernel::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.tools
            .insert((server.to_owned(), tool.to_owned()), Box::new(handler));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl ToolInvoker for MockInvoker {
    async fn invoke(&self, server: &str, tool: &str, arguments: Value) -> parley_kernel::Result<Value> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((server.to_owned(), tool.to_owned(), arguments.clone()));
        match self.tools.get(&(server.to_owned(), tool.to_owned())) {
            Some(handler) => handler(&arguments),
            None => Err(KernelError::ToolNotFound {
                server: server.to_owned(),
                tool: tool.to_owned(),
            }),
        }
    }

    fn server_tools(&self, server: &str) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .keys()
            .filter(|(s, _)| s == server)
            .map(|(_, t)| ToolDescriptor {
                name: t.clone(),
                description: format!("mock tool {t}"),
                input_schema: json!({"type": "object"}),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    fn has_server(&self, server: &str) -> bool {
        self.tools.keys().any(|(s, _)| s == server)
    }
}

// ---------------------------------------------------------------------------
// Club retrieval fixture
// ---------------------------------------------------------------------------

/// A retrieval service over a small indexed club corpus.  The returned
/// temp dir must stay alive as long as the service is in use.
pub async fn club_retrieval_fixture() -> (RetrievalService, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let embedder = Arc::new(HashEmbedder::new(64));
    let index = Arc::new(
        VectorIndex::open(dir.path(), 64)
            .await
            .expect("open index"),
    );

    let docs: &[(&str, &str, &str)] = &[
        (
            "coordinators/coordinators.csv",
            "coordinators",
            "Event: RoboSprint\nCoordinator: Priya Nair\nRole: Lead Coordinator\nContact: priya@club.example",
        ),
        (
            "events/robosprint.md",
            "events",
            "RoboSprint is an autonomous line-follower race held in March.",
        ),
        (
            "announcements/march.md",
            "announcements",
            "Registrations for RoboSprint close on Friday.",
        ),
    ];
    for (document_id, category, text) in docs {
        let chunk = Chunk {
            text: (*text).to_owned(),
            start_char: 0,
            end_char: text.chars().count(),
            metadata: json!({
                "document_id": document_id,
                "filename": document_id.rsplit('/').next().unwrap_or(document_id),
                "category": category,
                "event_name": "RoboSprint",
            }),
        };
        let embedding = parley_knowledge::Embedder::embed(embedder.as_ref(), text);
        index
            .add(vec![embedding], vec![chunk], document_id)
            .await
            .expect("index add");
    }

    let service = RetrievalService::new(embedder, index, CitationGraph::disabled());
    (service, dir)
}
