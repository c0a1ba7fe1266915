//! In-memory thread store.
//!
//! Threads live in a [`DashMap`]; each thread's message list sits behind its
//! own [`tokio::sync::Mutex`] so concurrent appends to one thread serialize
//! while appends to different threads proceed independently.  Nothing here
//! survives a restart.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::thread::{Message, Role, ThreadStatus, ThreadStore, ThreadSummary};

struct ThreadState {
    created_at: DateTime<Utc>,
    status: ThreadStatus,
    messages: Vec<Message>,
}

/// Process-local [`ThreadStore`] backend.
#[derive(Clone, Default)]
pub struct InMemoryThreadStore {
    threads: Arc<DashMap<Uuid, Arc<Mutex<ThreadState>>>>,
}

impl InMemoryThreadStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, thread_id: Uuid) -> StoreResult<Arc<Mutex<ThreadState>>> {
        self.threads
            .get(&thread_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(StoreError::ThreadNotFound { thread_id })
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn create_thread(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.threads.insert(
            id,
            Arc::new(Mutex::new(ThreadState {
                created_at: Utc::now(),
                status: ThreadStatus::Active,
                messages: Vec::new(),
            })),
        );
        info!(thread_id = %id, "thread created");
        id
    }

    async fn get(&self, thread_id: Uuid) -> StoreResult<ThreadSummary> {
        let state = self.state(thread_id)?;
        let state = state.lock().await;
        Ok(ThreadSummary {
            id: thread_id,
            created_at: state.created_at,
            status: state.status,
            message_count: state.messages.len(),
        })
    }

    async fn append(
        &self,
        thread_id: Uuid,
        role: Role,
        content: String,
        metadata: Value,
    ) -> StoreResult<Uuid> {
        let state = self.state(thread_id)?;
        // Holding the thread mutex across timestamping and push is what
        // guarantees append order equals arrival order.
        let mut state = state.lock().await;
        if state.status == ThreadStatus::Closed {
            return Err(StoreError::ThreadClosed { thread_id });
        }
        let message = Message {
            id: Uuid::new_v4(),
            role,
            content,
            timestamp: Utc::now(),
            metadata,
        };
        let message_id = message.id;
        state.messages.push(message);
        debug!(thread_id = %thread_id, message_id = %message_id, %role, "message appended");
        Ok(message_id)
    }

    async fn list_messages(&self, thread_id: Uuid) -> StoreResult<Vec<Message>> {
        let state = self.state(thread_id)?;
        let state = state.lock().await;
        Ok(state.messages.clone())
    }

    async fn clear_thread(&self, thread_id: Uuid) -> StoreResult<()> {
        let state = self.state(thread_id)?;
        let mut state = state.lock().await;
        let dropped = state.messages.len();
        state.messages.clear();
        info!(thread_id = %thread_id, dropped, "thread cleared");
        Ok(())
    }

    async fn delete(&self, thread_id: Uuid) -> bool {
        let existed = self.threads.remove(&thread_id).is_some();
        if existed {
            info!(thread_id = %thread_id, "thread deleted");
        }
        existed
    }

    async fn list_threads(&self) -> Vec<ThreadSummary> {
        let mut out = Vec::with_capacity(self.threads.len());
        for entry in self.threads.iter() {
            let state = entry.value().lock().await;
            out.push(ThreadSummary {
                id: *entry.key(),
                created_at: state.created_at,
                status: state.status,
                message_count: state.messages.len(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_and_list_preserve_order() {
        let store = InMemoryThreadStore::new();
        let thread = store.create_thread().await;

        for i in 0..5 {
            store
                .append(thread, Role::User, format!("message {i}"), json!({}))
                .await
                .unwrap();
        }

        let messages = store.list_messages(thread).await.unwrap();
        assert_eq!(messages.len(), 5);
        for (i, m) in messages.iter().enumerate() {
            assert_eq!(m.content, format!("message {i}"));
        }
        // Timestamps are monotonically non-decreasing in append order.
        for pair in messages.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_thread_all_land() {
        let store = InMemoryThreadStore::new();
        let thread = store.create_thread().await;

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(thread, Role::User, format!("m{i}"), json!({}))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let messages = store.list_messages(thread).await.unwrap();
        assert_eq!(messages.len(), 32);
        // No duplicates and no holes, whatever the interleaving.
        let mut seen: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 32);
    }

    #[tokio::test]
    async fn missing_thread_is_an_error() {
        let store = InMemoryThreadStore::new();
        let ghost = Uuid::new_v4();

        assert!(matches!(
            store.get(ghost).await,
            Err(StoreError::ThreadNotFound { .. })
        ));
        assert!(matches!(
            store
                .append(ghost, Role::User, "hi".into(), json!({}))
                .await,
            Err(StoreError::ThreadNotFound { .. })
        ));
        assert!(!store.delete(ghost).await);
    }

    #[tokio::test]
    async fn delete_removes_thread_and_clear_keeps_it() {
        let store = InMemoryThreadStore::new();
        let thread = store.create_thread().await;
        store
            .append(thread, Role::User, "hello".into(), json!({}))
            .await
            .unwrap();

        store.clear_thread(thread).await.unwrap();
        assert_eq!(store.list_messages(thread).await.unwrap().len(), 0);
        assert_eq!(store.list_threads().await.len(), 1);

        assert!(store.delete(thread).await);
        assert!(store.list_threads().await.is_empty());
        assert!(store.get(thread).await.is_err());
    }
}
