//! Parley kernel.
//!
//! Foundational plumbing for talking to tool servers:
//!
//! - **[`protocol`]** -- line-delimited JSON-RPC frames and the tool/resource
//!   descriptor shapes discovered at bring-up.
//! - **[`transport`]** -- one owned handle per tool-server subprocess: writer
//!   lock, reader task, waiter map demultiplexed by request id, per-call
//!   deadlines, and bounded in-flight calls.
//! - **[`registry`]** -- server table with discovery, status tracking, and
//!   the narrow [`ToolInvoker`] capability handed to the orchestration layer.
//! - **[`error`]** -- unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{KernelError, Result};
pub use protocol::{RequestFrame, ResourceDescriptor, ResponseFrame, ToolDescriptor};
pub use registry::{ServerInfo, ServerStatus, ToolInvoker, ToolRegistry};
pub use transport::{DEFAULT_MAX_IN_FLIGHT, ServerCommand, ToolServerHandle};
