//! Minimal typed wrappers for the MCP methods the proxy speaks.
//!
//! These types are intentionally a *subset* of the full MCP schema. Tool input
//! schemas are carried as raw `serde_json::Value` so upstream schemas pass
//! through the proxy byte-identically.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP protocol version used during `initialize` on both sides of the proxy.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

pub const PROXY_SERVER_NAME: &str = "mcp-lens";
pub const PROXY_SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Raw JSON Schema, forwarded unmodified.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
    #[serde(
        rename = "outputSchema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ListToolsResult {
    #[serde(
        rename = "nextCursor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub next_cursor: Option<String>,
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CallToolResult {
    pub content: Vec<Value>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![text_content(text)],
            is_error: None,
            structured_content: None,
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: vec![text_content(format!("Error: {message}"))],
            is_error: Some(true),
            structured_content: None,
        }
    }
}

pub fn text_content(text: impl Into<String>) -> Value {
    serde_json::json!({ "type": "text", "text": text.into() })
}

/// Renders a content-block list as the text the client would read.
///
/// Text blocks contribute their `text` verbatim; other block kinds contribute
/// their JSON serialization. Blocks are joined with newlines.
pub fn render_text(content: &[Value]) -> String {
    let mut parts = Vec::with_capacity(content.len());
    for block in content {
        match block.get("text").and_then(|v| v.as_str()) {
            Some(text) => parts.push(text.to_string()),
            None => parts.push(block.to_string()),
        }
    }
    parts.join("\n")
}

/// Serialized size of a content-block list in bytes, as cached entries are
/// accounted.
pub fn serialized_size(content: &[Value]) -> usize {
    serde_json::to_string(content).map(|s| s.len()).unwrap_or(0)
}
