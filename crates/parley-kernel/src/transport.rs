//! Typed channel to a single tool server.
//!
//! Each tool server is a child process spoken to over its stdin/stdout with
//! the line-delimited JSON-RPC dialect from [`crate::protocol`].  The handle
//! owns the only path to the peer: a write half behind a mutex and a reader
//! task that demultiplexes response frames back to waiting callers by
//! request id.
//!
//! Failure behavior:
//!
//! - A call that misses its deadline releases its waiter and returns
//!   [`KernelError::Timeout`]; the subprocess is left running because other
//!   calls may still be in flight.
//! - If the subprocess exits, every pending waiter resolves to
//!   [`KernelError::PeerGone`] and the handle reports itself degraded until
//!   it is restarted by the owner.
//! - A line that does not parse as a response frame is logged and skipped;
//!   a misbehaving peer must not take down the connection.
//!
//! In-flight calls per server are capped by a [`Semaphore`], which doubles
//! as the admission control required by the backpressure policy.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Semaphore, oneshot};
use tracing::{debug, info, warn};

use crate::error::{KernelError, Result};
use crate::protocol::{
    METHOD_CALL_TOOL, METHOD_LIST_RESOURCES, METHOD_LIST_TOOLS, RequestFrame, ResourceDescriptor,
    ResponseFrame, ToolDescriptor,
};

/// Default cap on concurrent in-flight calls to a single server.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

// ---------------------------------------------------------------------------
// Server command
// ---------------------------------------------------------------------------

/// How to launch a tool server subprocess.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerCommand {
    /// Executable to run (e.g. `python`).
    pub program: String,
    /// Arguments, typically the server script path.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the subprocess.
    #[serde(default)]
    pub envs: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

type Waiter = oneshot::Sender<Result<Value>>;

struct TransportInner {
    server_id: String,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    waiters: DashMap<u64, Waiter>,
    next_id: AtomicU64,
    permits: Semaphore,
    degraded: AtomicBool,
    child: std::sync::Mutex<Option<Child>>,
}

impl TransportInner {
    /// Fail every pending waiter and refuse new calls.
    fn mark_gone(&self) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let pending: Vec<u64> = self.waiters.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(KernelError::PeerGone {
                    server: self.server_id.clone(),
                }));
            }
        }
        warn!(server = %self.server_id, "tool server transport closed; handle degraded");
    }
}

/// Owned handle to one tool-server subprocess.
///
/// Cheaply cloneable (`Arc`-backed); all clones share the same subprocess,
/// waiter table, and concurrency budget.
#[derive(Clone)]
pub struct ToolServerHandle {
    inner: Arc<TransportInner>,
}

impl ToolServerHandle {
    /// Spawn the subprocess described by `command` and attach to its stdio.
    pub fn spawn(
        server_id: impl Into<String>,
        command: &ServerCommand,
        max_in_flight: usize,
    ) -> Result<Self> {
        let server_id = server_id.into();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| KernelError::Spawn {
                server: server_id.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| KernelError::Spawn {
            server: server_id.clone(),
            source: std::io::Error::other("child stdin not captured"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| KernelError::Spawn {
            server: server_id.clone(),
            source: std::io::Error::other("child stdout not captured"),
        })?;

        let handle = Self::from_streams(server_id, stdin, stdout, max_in_flight);
        *handle.inner.child.lock().expect("child slot poisoned") = Some(child);
        info!(server = %handle.inner.server_id, program = %command.program, "tool server spawned");
        Ok(handle)
    }

    /// Build a handle over arbitrary streams.
    ///
    /// `spawn` uses this with the child's stdio; tests drive it over an
    /// in-memory duplex pipe.
    pub fn from_streams<W, R>(
        server_id: impl Into<String>,
        writer: W,
        reader: R,
        max_in_flight: usize,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let inner = Arc::new(TransportInner {
            server_id: server_id.into(),
            writer: Mutex::new(Box::new(writer)),
            waiters: DashMap::new(),
            next_id: AtomicU64::new(1),
            permits: Semaphore::new(max_in_flight.max(1)),
            degraded: AtomicBool::new(false),
            child: std::sync::Mutex::new(None),
        });
        Self::start_reader(Arc::clone(&inner), reader);
        Self { inner }
    }

    fn start_reader<R>(inner: Arc<TransportInner>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ResponseFrame>(line) {
                            Ok(frame) => Self::dispatch(&inner, frame),
                            Err(e) => {
                                warn!(
                                    server = %inner.server_id,
                                    error = %e,
                                    "skipping malformed frame from peer"
                                );
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(server = %inner.server_id, error = %e, "transport read failed");
                        break;
                    }
                }
            }
            inner.mark_gone();
        });
    }

    fn dispatch(inner: &TransportInner, frame: ResponseFrame) {
        let Some((_, tx)) = inner.waiters.remove(&frame.id) else {
            // Late reply for a caller that already timed out.
            debug!(server = %inner.server_id, id = frame.id, "dropping unmatched response frame");
            return;
        };
        let value = if frame.error.is_some() {
            Err(KernelError::RemoteFailure {
                server: inner.server_id.clone(),
                message: frame.error_message(),
            })
        } else {
            Ok(frame.result.unwrap_or(Value::Null))
        };
        let _ = tx.send(value);
    }

    /// The id this handle was registered under.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Whether the peer is gone and the handle needs a restart.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // RPC surface
    // -----------------------------------------------------------------------

    /// Send one request and await its response, bounded by `deadline`.
    pub async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        if self.is_degraded() {
            return Err(KernelError::PeerGone {
                server: self.inner.server_id.clone(),
            });
        }

        let _permit =
            self.inner
                .permits
                .acquire()
                .await
                .map_err(|_| KernelError::PeerGone {
                    server: self.inner.server_id.clone(),
                })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.insert(id, tx);

        let frame = RequestFrame {
            id,
            method: method.to_owned(),
            params,
        };
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');

        let write_result: std::io::Result<()> = {
            let mut writer = self.inner.writer.lock().await;
            async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await
        };
        if let Err(e) = write_result {
            self.inner.waiters.remove(&id);
            warn!(server = %self.inner.server_id, error = %e, "write to tool server failed");
            self.inner.mark_gone();
            return Err(KernelError::PeerGone {
                server: self.inner.server_id.clone(),
            });
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: the reader task cleaned up after peer exit.
            Ok(Err(_)) => Err(KernelError::PeerGone {
                server: self.inner.server_id.clone(),
            }),
            Err(_) => {
                self.inner.waiters.remove(&id);
                warn!(server = %self.inner.server_id, method, id, "call deadline exceeded");
                Err(KernelError::Timeout {
                    server: self.inner.server_id.clone(),
                    method: method.to_owned(),
                })
            }
        }
    }

    /// Discover the tools this server exposes.
    pub async fn list_tools(&self, deadline: Duration) -> Result<Vec<ToolDescriptor>> {
        let value = self.call(METHOD_LIST_TOOLS, json!({}), deadline).await?;
        Self::parse_listing(&self.inner.server_id, value, "tools")
    }

    /// Invoke a named tool with the given arguments.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value> {
        self.call(
            METHOD_CALL_TOOL,
            json!({ "name": name, "arguments": arguments }),
            deadline,
        )
        .await
    }

    /// List resources, if the server implements the optional method.
    ///
    /// Servers without `list_resources` answer with an error payload; that
    /// degrades to an empty listing rather than a failure.
    pub async fn list_resources(&self, deadline: Duration) -> Result<Vec<ResourceDescriptor>> {
        match self.call(METHOD_LIST_RESOURCES, json!({}), deadline).await {
            Ok(value) => Self::parse_listing(&self.inner.server_id, value, "resources"),
            Err(KernelError::RemoteFailure { server, message }) => {
                debug!(server = %server, message, "server does not implement list_resources");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Kill the subprocess (if any) and degrade the handle.
    pub async fn shutdown(&self) {
        let child = self.inner.child.lock().expect("child slot poisoned").take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
        self.inner.mark_gone();
    }

    /// Accept both a bare array and an object wrapping the array under `key`.
    fn parse_listing<T: serde::de::DeserializeOwned>(
        server: &str,
        value: Value,
        key: &str,
    ) -> Result<Vec<T>> {
        let array = match value {
            Value::Array(_) => value,
            Value::Object(ref map) if map.contains_key(key) => map[key].clone(),
            other => {
                return Err(KernelError::MalformedFrame {
                    server: server.to_owned(),
                    detail: format!("expected `{key}` listing, got: {other}"),
                });
            }
        };
        serde_json::from_value(array).map_err(|e| KernelError::MalformedFrame {
            server: server.to_owned(),
            detail: e.to_string(),
        })
    }
}

impl std::fmt::Debug for ToolServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServerHandle")
            .field("server_id", &self.inner.server_id)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    /// A scripted peer: reads request frames and answers with `respond`.
    fn scripted_peer<F>(
        peer: tokio::io::DuplexStream,
        respond: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(RequestFrame) -> Option<String> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = split(peer);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let frame: RequestFrame = serde_json::from_str(&line).unwrap();
                if let Some(reply) = respond(frame) {
                    write.write_all(reply.as_bytes()).await.unwrap();
                    write.write_all(b"\n").await.unwrap();
                }
            }
        })
    }

    fn handle_over(peer_facing: tokio::io::DuplexStream) -> ToolServerHandle {
        let (read, write) = split(peer_facing);
        ToolServerHandle::from_streams("test", write, read, 4)
    }

    #[tokio::test]
    async fn call_round_trips_result_by_id() {
        let (ours, theirs) = duplex(4096);
        scripted_peer(theirs, |req| {
            Some(format!(
                r#"{{"id": {}, "result": {{"echo": {}}}}}"#,
                req.id, req.params
            ))
        });
        let handle = handle_over(ours);

        let out = handle
            .call("call_tool", json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, json!({"echo": {"x": 1}}));
    }

    #[tokio::test]
    async fn deadline_releases_waiter_without_killing_peer() {
        let (ours, theirs) = duplex(4096);
        scripted_peer(theirs, |_| None);
        let handle = handle_over(ours);

        let err = handle
            .call("call_tool", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Timeout { .. }));
        // The transport is still usable after a timeout.
        assert!(!handle.is_degraded());
    }

    #[tokio::test]
    async fn peer_exit_fails_pending_and_future_calls() {
        let (ours, theirs) = duplex(4096);
        let handle = handle_over(ours);

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .call("call_tool", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(theirs);

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_peer_gone());
        assert!(handle.is_degraded());

        let err = handle
            .call("call_tool", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_peer_gone());
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped_not_fatal() {
        let (ours, theirs) = duplex(4096);
        scripted_peer(theirs, |req| {
            Some(format!(
                "this is not json\n{{\"id\": {}, \"result\": 7}}",
                req.id
            ))
        });
        let handle = handle_over(ours);

        let out = handle
            .call("call_tool", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, json!(7));
    }

    #[tokio::test]
    async fn error_payload_surfaces_as_remote_failure() {
        let (ours, theirs) = duplex(4096);
        scripted_peer(theirs, |req| {
            Some(format!(
                r#"{{"id": {}, "error": {{"message": "boom"}}}}"#,
                req.id
            ))
        });
        let handle = handle_over(ours);

        let err = handle
            .call("call_tool", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            KernelError::RemoteFailure { message, .. } => assert_eq!(message, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn list_tools_accepts_wrapped_and_bare_listings() {
        let (ours, theirs) = duplex(4096);
        scripted_peer(theirs, |req| {
            let body = if req.id % 2 == 1 {
                r#"{"tools": [{"name": "web_search", "description": "", "input_schema": {}}]}"#
            } else {
                r#"[{"name": "web_search", "description": "", "input_schema": {}}]"#
            };
            Some(format!(r#"{{"id": {}, "result": {body}}}"#, req.id))
        });
        let handle = handle_over(ours);

        for _ in 0..2 {
            let tools = handle.list_tools(Duration::from_secs(1)).await.unwrap();
            assert_eq!(tools.len(), 1);
            assert_eq!(tools[0].name, "web_search");
        }
    }

    #[tokio::test]
    async fn missing_list_resources_degrades_to_empty() {
        let (ours, theirs) = duplex(4096);
        scripted_peer(theirs, |req| {
            Some(format!(
                r#"{{"id": {}, "error": "method not found"}}"#,
                req.id
            ))
        });
        let handle = handle_over(ours);

        let resources = handle.list_resources(Duration::from_secs(1)).await.unwrap();
        assert!(resources.is_empty());
    }
}
