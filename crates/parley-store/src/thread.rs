//! Conversation threads and messages.
//!
//! A thread is an ordered sequence of messages under a single opaque id.
//! Messages are immutable once appended; ordering is strictly the append
//! order observed by the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreResult;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A single message within a thread.  Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// Who produced this message.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// When the store accepted the append.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata (tools used, confidence, ...).
    #[serde(default)]
    pub metadata: Value,
}

/// Thread lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Closed,
}

/// Summary view of a thread, without its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: ThreadStatus,
    pub message_count: usize,
}

// ═══════════════════════════════════════════════════════════════════════
//  Store trait
// ═══════════════════════════════════════════════════════════════════════

/// Storage contract for conversation threads.
///
/// The shipped backend is in-memory ([`crate::memory::InMemoryThreadStore`]);
/// durability is deliberately out of scope.  A durable backend only has to
/// implement this trait -- callers never see the backing.
///
/// Implementations must serialize appends per thread so that message order
/// matches the arrival order seen by the store.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Create a new, empty, active thread and return its id.
    async fn create_thread(&self) -> Uuid;

    /// Summary for one thread.
    async fn get(&self, thread_id: Uuid) -> StoreResult<ThreadSummary>;

    /// Append a message; returns the new message's id.
    async fn append(
        &self,
        thread_id: Uuid,
        role: Role,
        content: String,
        metadata: Value,
    ) -> StoreResult<Uuid>;

    /// All messages of a thread in append order.
    async fn list_messages(&self, thread_id: Uuid) -> StoreResult<Vec<Message>>;

    /// Remove all messages but keep the thread.
    async fn clear_thread(&self, thread_id: Uuid) -> StoreResult<()>;

    /// Delete a thread entirely; returns whether it existed.
    async fn delete(&self, thread_id: Uuid) -> bool;

    /// Summaries of every known thread.
    async fn list_threads(&self) -> Vec<ThreadSummary>;
}
