//! Chat facade.
//!
//! The per-thread entry point consumed by the HTTP layer: owns conversation
//! history, runs the orchestrator, and persists both sides of the exchange.
//! Streaming is simulated -- the completed reply is chunked into fixed-size
//! pieces separated by a small artificial delay; the `done` event carries
//! the final tool usage.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument};
use uuid::Uuid;

use parley_store::{Message, Role, ThreadStore, ThreadSummary};

use crate::error::Result;
use crate::orchestrator::Orchestrator;

// ---------------------------------------------------------------------------
// Reply types
// ---------------------------------------------------------------------------

/// The complete response to one `send`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub message: String,
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub tools_used: Vec<String>,
    /// Wall-clock seconds the orchestration took.
    pub execution_time: f64,
    pub metadata: Value,
}

/// One event of a simulated stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token { content: String },
    ToolCall { tool: String },
    ToolResult { tool: String },
    Done { tools_used: Vec<String>, metadata: Value },
    Error { content: String },
}

/// Characters per simulated streaming chunk.
const STREAM_CHUNK_CHARS: usize = 48;
/// Artificial delay between chunks.
const STREAM_CHUNK_DELAY: Duration = Duration::from_millis(20);

/// How many prior messages the orchestrator sees as history.
const HISTORY_WINDOW: usize = 20;

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Per-thread chat entry over the orchestrator and the thread store.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ThreadStore>,
    orchestrator: Arc<Orchestrator>,
}

impl ChatService {
    pub fn new(store: Arc<dyn ThreadStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Create a new conversation thread.
    pub async fn create_thread(&self) -> Uuid {
        self.store.create_thread().await
    }

    /// Process one user message and return the completed reply.
    #[instrument(skip(self, text), fields(thread_id = %thread_id))]
    pub async fn send(&self, thread_id: Uuid, text: &str) -> Result<ChatReply> {
        // Fail fast on unknown threads before touching the orchestrator.
        self.store.get(thread_id).await?;

        let started = std::time::Instant::now();
        let history = self.history(thread_id).await?;
        self.store
            .append(thread_id, Role::User, text.to_owned(), json!({}))
            .await?;

        let outcome = self.orchestrator.run(text, &history).await;

        let metadata = json!({
            "red_flag": outcome.red_flag,
            "confidence": outcome.confidence,
            "iterations": outcome.iterations,
            "total_tasks": outcome.total_tasks,
            "successful_tasks": outcome.successful_tasks,
            "tasks_with_context": outcome.tasks_with_context,
            "planner_fallbacks": outcome.planner_fallbacks,
            "pending_approvals": outcome.pending_approvals,
            "tools_used": outcome.tools_used,
        });
        let message_id = self
            .store
            .append(
                thread_id,
                Role::Assistant,
                outcome.response.clone(),
                metadata.clone(),
            )
            .await?;

        let execution_time = started.elapsed().as_secs_f64();
        info!(execution_time, tools = outcome.tools_used.len(), "chat turn complete");

        Ok(ChatReply {
            message: outcome.response,
            message_id,
            thread_id,
            tools_used: outcome.tools_used,
            execution_time,
            metadata,
        })
    }

    /// Process one user message and stream the reply in simulated chunks.
    ///
    /// The orchestration itself is not token-streamed; the completed reply
    /// is sliced into fixed-size pieces with an artificial delay.
    pub async fn stream(
        &self,
        thread_id: Uuid,
        text: &str,
    ) -> Result<ReceiverStream<StreamEvent>> {
        self.store.get(thread_id).await?;

        let (tx, rx) = mpsc::channel(16);
        let service = self.clone();
        let text = text.to_owned();
        tokio::spawn(async move {
            match service.send(thread_id, &text).await {
                Ok(reply) => {
                    for tool in &reply.tools_used {
                        let _ = tx.send(StreamEvent::ToolCall { tool: tool.clone() }).await;
                        let _ = tx
                            .send(StreamEvent::ToolResult { tool: tool.clone() })
                            .await;
                    }
                    let chars: Vec<char> = reply.message.chars().collect();
                    for chunk in chars.chunks(STREAM_CHUNK_CHARS) {
                        let event = StreamEvent::Token {
                            content: chunk.iter().collect(),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(STREAM_CHUNK_DELAY).await;
                    }
                    let _ = tx
                        .send(StreamEvent::Done {
                            tools_used: reply.tools_used,
                            metadata: reply.metadata,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Error {
                            content: e.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// All messages of a thread in append order.
    pub async fn messages(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        Ok(self.store.list_messages(thread_id).await?)
    }

    /// Delete a thread; returns whether it existed.
    pub async fn delete_thread(&self, thread_id: Uuid) -> bool {
        self.store.delete(thread_id).await
    }

    /// Summaries of all threads.
    pub async fn list_threads(&self) -> Vec<ThreadSummary> {
        self.store.list_threads().await
    }

    /// Recent history as `role: content` lines, oldest first.
    async fn history(&self, thread_id: Uuid) -> Result<Vec<String>> {
        let messages = self.store.list_messages(thread_id).await?;
        Ok(messages
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect())
    }
}
