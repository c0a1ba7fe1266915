//! Tool registry.
//!
//! At bring-up the registry asks every configured server for its tool
//! descriptors.  A server that fails discovery is recorded as disabled: its
//! tools are never enumerated and any invocation against it fails with
//! `ToolNotFound` without touching the transport.  Server ids are canonical;
//! registering a second server under an existing id is rejected.
//!
//! Backed by [`DashMap`] so lookups are lock-free and `invoke` never holds a
//! map guard across an await.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{KernelError, Result};
use crate::protocol::ToolDescriptor;
use crate::transport::ToolServerHandle;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Discovery succeeded; the server is routable.
    Connected,
    /// Discovery failed at bring-up; the server is not routable.
    Disabled,
    /// The subprocess went away after bring-up.
    Degraded,
}

/// Registry view of one server, for status reporting.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: String,
    pub status: ServerStatus,
    pub tool_count: usize,
    pub registered_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Invoker trait
// ---------------------------------------------------------------------------

/// The narrow capability the orchestration layer needs: route a
/// `(server, tool, arguments)` triple to a peer and report what exists.
///
/// Passing this trait instead of the whole registry keeps the orchestrator
/// decoupled from server lifecycle management.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` on `server`.  Fails with `ToolNotFound` when the pair
    /// is unknown, without any network traffic.
    async fn invoke(&self, server: &str, tool: &str, arguments: Value) -> Result<Value>;

    /// Descriptors for the tools `server` exposes (empty when unknown or
    /// disabled).
    fn server_tools(&self, server: &str) -> Vec<ToolDescriptor>;

    /// Whether `server` is registered and routable.
    fn has_server(&self, server: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ServerEntry {
    handle: ToolServerHandle,
    status: ServerStatus,
    tools: Vec<ToolDescriptor>,
    registered_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// Concurrent registry of tool servers, cheaply cloneable and `Send + Sync`.
#[derive(Clone)]
pub struct ToolRegistry {
    servers: Arc<DashMap<String, ServerEntry>>,
    call_deadline: Duration,
}

impl ToolRegistry {
    /// Create a registry whose invocations use `call_deadline` per call.
    pub fn new(call_deadline: Duration) -> Self {
        Self {
            servers: Arc::new(DashMap::new()),
            call_deadline,
        }
    }

    /// Register `handle` under `server_id` and run tool discovery.
    ///
    /// Returns the number of tools discovered.  Discovery failure does not
    /// remove the entry; the server is recorded as disabled so its absence
    /// is visible in status reporting.
    pub async fn register(
        &self,
        server_id: impl Into<String>,
        handle: ToolServerHandle,
    ) -> Result<usize> {
        let server_id = server_id.into();
        if self.servers.contains_key(&server_id) {
            return Err(KernelError::DuplicateServer { server: server_id });
        }

        let (status, tools, last_error) = match handle.list_tools(self.call_deadline).await {
            Ok(tools) => {
                info!(server = %server_id, tools = tools.len(), "tool server registered");
                (ServerStatus::Connected, tools, None)
            }
            Err(e) => {
                warn!(server = %server_id, error = %e, "tool discovery failed; server disabled");
                (ServerStatus::Disabled, Vec::new(), Some(e.to_string()))
            }
        };

        let count = tools.len();
        self.servers.insert(
            server_id,
            ServerEntry {
                handle,
                status,
                tools,
                registered_at: Utc::now(),
                last_error,
            },
        );
        Ok(count)
    }

    /// Status snapshot of every registered server.
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.servers
            .iter()
            .map(|e| ServerInfo {
                id: e.key().clone(),
                status: e.status,
                tool_count: e.tools.len(),
                registered_at: e.registered_at,
                last_error: e.last_error.clone(),
            })
            .collect()
    }

    /// Ids of servers that completed discovery and are routable.
    pub fn connected_servers(&self) -> Vec<String> {
        self.servers
            .iter()
            .filter(|e| e.status == ServerStatus::Connected)
            .map(|e| e.key().clone())
            .collect()
    }

    /// All `(server, tool)` descriptors across connected servers.
    pub fn all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        self.servers
            .iter()
            .filter(|e| e.status == ServerStatus::Connected)
            .flat_map(|e| {
                e.tools
                    .iter()
                    .map(|t| (e.key().clone(), t.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Kill every subprocess and drop the table.
    pub async fn shutdown(&self) {
        let handles: Vec<ToolServerHandle> =
            self.servers.iter().map(|e| e.handle.clone()).collect();
        for handle in handles {
            handle.shutdown().await;
        }
        self.servers.clear();
        info!("tool registry shut down");
    }

    /// Look up a routable handle, or the reason it is not routable.
    fn routable_handle(&self, server: &str, tool: &str) -> Result<ToolServerHandle> {
        let entry = self
            .servers
            .get(server)
            .ok_or_else(|| KernelError::ToolNotFound {
                server: server.to_owned(),
                tool: tool.to_owned(),
            })?;
        if entry.status != ServerStatus::Connected {
            return Err(KernelError::ToolNotFound {
                server: server.to_owned(),
                tool: tool.to_owned(),
            });
        }
        if !entry.tools.iter().any(|t| t.name == tool) {
            return Err(KernelError::ToolNotFound {
                server: server.to_owned(),
                tool: tool.to_owned(),
            });
        }
        Ok(entry.handle.clone())
    }

    fn mark_degraded(&self, server: &str, error: &KernelError) {
        if let Some(mut entry) = self.servers.get_mut(server) {
            entry.status = ServerStatus::Degraded;
            entry.last_error = Some(error.to_string());
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(&self, server: &str, tool: &str, arguments: Value) -> Result<Value> {
        if !arguments.is_object() && !arguments.is_null() {
            return Err(KernelError::InvalidArguments {
                server: server.to_owned(),
                tool: tool.to_owned(),
                reason: "arguments must be a JSON object".to_owned(),
            });
        }
        // Clone the handle out so no map guard is held across the await.
        let handle = self.routable_handle(server, tool)?;
        match handle.call_tool(tool, arguments, self.call_deadline).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_peer_gone() {
                    self.mark_degraded(server, &e);
                }
                Err(e)
            }
        }
    }

    fn server_tools(&self, server: &str) -> Vec<ToolDescriptor> {
        self.servers
            .get(server)
            .filter(|e| e.status == ServerStatus::Connected)
            .map(|e| e.tools.clone())
            .unwrap_or_default()
    }

    fn has_server(&self, server: &str) -> bool {
        self.servers
            .get(server)
            .is_some_and(|e| e.status == ServerStatus::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    use crate::protocol::RequestFrame;

    /// Peer that answers `list_tools` with one `echo` tool and `call_tool`
    /// by echoing arguments back.
    fn echo_peer(peer: tokio::io::DuplexStream) {
        tokio::spawn(async move {
            let (read, mut write) = split(peer);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: RequestFrame = serde_json::from_str(&line).unwrap();
                let reply = match req.method.as_str() {
                    "list_tools" => json!({
                        "id": req.id,
                        "result": [{"name": "echo", "description": "echo", "input_schema": {}}]
                    }),
                    "call_tool" => json!({"id": req.id, "result": req.params["arguments"]}),
                    _ => json!({"id": req.id, "error": "method not found"}),
                };
                write.write_all(reply.to_string().as_bytes()).await.unwrap();
                write.write_all(b"\n").await.unwrap();
            }
        });
    }

    fn echo_handle(id: &str) -> ToolServerHandle {
        let (ours, theirs) = duplex(4096);
        echo_peer(theirs);
        let (read, write) = split(ours);
        ToolServerHandle::from_streams(id, write, read, 4)
    }

    #[tokio::test]
    async fn register_discovers_tools_and_routes_calls() {
        let registry = ToolRegistry::new(Duration::from_secs(1));
        let count = registry.register("web", echo_handle("web")).await.unwrap();
        assert_eq!(count, 1);
        assert!(registry.has_server("web"));

        let out = registry
            .invoke("web", "echo", json!({"query": "pid control"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"query": "pid control"}));
    }

    #[tokio::test]
    async fn duplicate_server_id_is_rejected() {
        let registry = ToolRegistry::new(Duration::from_secs(1));
        registry
            .register("calendar", echo_handle("calendar"))
            .await
            .unwrap();
        let err = registry
            .register("calendar", echo_handle("calendar"))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::DuplicateServer { .. }));
    }

    #[tokio::test]
    async fn unknown_server_or_tool_fails_without_network() {
        let registry = ToolRegistry::new(Duration::from_secs(1));
        registry.register("web", echo_handle("web")).await.unwrap();

        let err = registry.invoke("gmail", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, KernelError::ToolNotFound { .. }));

        let err = registry
            .invoke("web", "send_email", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_discovery_disables_server() {
        // Peer that closes immediately: list_tools gets PeerGone.
        let (ours, theirs) = duplex(64);
        drop(theirs);
        let (read, write) = split(ours);
        let handle = ToolServerHandle::from_streams("drive", write, read, 4);

        let registry = ToolRegistry::new(Duration::from_millis(100));
        registry.register("drive", handle).await.unwrap();

        assert!(!registry.has_server("drive"));
        assert!(registry.server_tools("drive").is_empty());
        let err = registry.invoke("drive", "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, KernelError::ToolNotFound { .. }));

        let info = &registry.servers()[0];
        assert_eq!(info.status, ServerStatus::Disabled);
        assert!(info.last_error.is_some());
    }
}
