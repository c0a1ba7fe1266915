//! Kernel error types.
//!
//! Transport-level failures (`PeerGone`, `Timeout`, `MalformedFrame`) are
//! raised by [`crate::transport`]; tool-level failures (`ToolNotFound`,
//! `InvalidArguments`, `RemoteFailure`) by [`crate::registry`].  Callers in
//! the worker layer are expected to recover from every variant by recording
//! a failed task result; none of these is fatal to a request.

/// Unified error type for the kernel crate.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Transport errors ----------------------------------------------------
    /// The tool-server subprocess exited (or its pipe closed) while requests
    /// were still pending.
    #[error("tool server `{server}` is gone")]
    PeerGone { server: String },

    /// A call did not complete within its deadline.  The waiter has been
    /// released; the subprocess itself is left running.
    #[error("call to `{server}.{method}` timed out")]
    Timeout { server: String, method: String },

    /// The peer wrote a line that is not a valid response frame.
    #[error("malformed frame from `{server}`: {detail}")]
    MalformedFrame { server: String, detail: String },

    /// The subprocess could not be started.
    #[error("failed to spawn tool server `{server}`: {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    // -- Tool errors ---------------------------------------------------------
    /// The `(server, tool)` pair is not known to the registry.  Returned
    /// without touching the transport.
    #[error("unknown tool `{tool}` on server `{server}`")]
    ToolNotFound { server: String, tool: String },

    /// The arguments did not match the tool's declared input schema.
    #[error("invalid arguments for `{server}.{tool}`: {reason}")]
    InvalidArguments {
        server: String,
        tool: String,
        reason: String,
    },

    /// The peer answered with an error payload.
    #[error("tool server `{server}` reported an error: {message}")]
    RemoteFailure { server: String, message: String },

    /// A second server was registered under an already-taken id.
    #[error("duplicate tool server id `{server}`")]
    DuplicateServer { server: String },

    // -- Upstream ------------------------------------------------------------
    /// I/O error on the transport pipes.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON framing error on our own side.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelError {
    /// Whether this error means the peer process is unusable until restart.
    pub fn is_peer_gone(&self) -> bool {
        matches!(self, Self::PeerGone { .. })
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
