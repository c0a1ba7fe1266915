//! Wire protocol for tool servers.
//!
//! Tool servers are child processes speaking line-delimited JSON over stdio.
//! Requests carry `{id, method, params}`, responses `{id, result}` or
//! `{id, error}`.  The protocol is not versioned; three methods are
//! recognized at this boundary:
//!
//! - `list_tools` → array of [`ToolDescriptor`]
//! - `call_tool {name, arguments}` → tool-defined value
//! - `list_resources` (optional) → array of [`ResourceDescriptor`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A request frame written to the peer's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlates the response back to the waiting caller.
    pub id: u64,
    /// Method name (`list_tools`, `call_tool`, `list_resources`).
    pub method: String,
    /// Method parameters; `{}` when the method takes none.
    pub params: Value,
}

/// A response frame read from the peer's stdout.
///
/// Exactly one of `result` and `error` is expected to be populated.  A frame
/// with both is treated as an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseFrame {
    /// Render the error payload as a human-readable message.
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| v.to_string()),
            None => "unknown error".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// A tool exposed by a server, discovered via `list_tools` at bring-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Machine-readable tool name (e.g. `web_search`, `retrieve_context`).
    pub name: String,
    /// Human-readable description, shown to the LLM during tool selection.
    #[serde(default)]
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Value,
}

/// A resource advertised by a server via the optional `list_resources`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, alias = "mimeType")]
    pub mime_type: String,
    #[serde(default)]
    pub description: String,
}

// ---------------------------------------------------------------------------
// Method names
// ---------------------------------------------------------------------------

/// Method name for tool discovery.
pub const METHOD_LIST_TOOLS: &str = "list_tools";
/// Method name for tool invocation.
pub const METHOD_CALL_TOOL: &str = "call_tool";
/// Method name for the optional resource listing.
pub const METHOD_LIST_RESOURCES: &str = "list_resources";
