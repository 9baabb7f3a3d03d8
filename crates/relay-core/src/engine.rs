//! Engine message types
//!
//! The assistant engine emits a stream of newline-delimited JSON messages
//! during a turn. This is a closed sum type: every message the gateway cares
//! about has a variant, and unknown result subtypes collapse into
//! [`ResultSubtype::Other`] instead of failing deserialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message in the engine's native stream format.
///
/// One turn is: an optional `init`, any number of `text` / `tool_use` /
/// `tool_result` messages, terminated by exactly one `result` (unless the
/// stream is truncated by timeout or cancellation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    /// Session setup: engine session id plus connected auxiliary tool servers.
    Init {
        session_id: String,
        #[serde(default)]
        tool_servers: Vec<ToolServer>,
    },
    /// A content delta attributable to the assistant turn.
    Text { text: String },
    /// A tool invocation request, e.g. `Write` with `file_path` in `input`.
    ToolUse { name: String, input: Value },
    /// Outcome of a tool invocation. Permission denials arrive here with
    /// `is_error = true`; they are diagnostic, not fatal to the turn.
    ToolResult {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Option<String>,
    },
    /// Terminal marker for the turn.
    Result { subtype: ResultSubtype },
}

impl EngineMessage {
    /// True for the terminal `result` message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineMessage::Result { .. })
    }

    /// The target path of a `Write` tool call, if this is one.
    pub fn write_target(&self) -> Option<&str> {
        match self {
            EngineMessage::ToolUse { name, input } if name == "Write" => {
                input.get("file_path").and_then(Value::as_str)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServer {
    pub name: String,
    pub status: ToolServerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolServerStatus {
    Connected,
    Failed,
}

/// Result subtypes reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    Error,
    ErrorMaxTurns,
    #[serde(other)]
    Other,
}

impl ResultSubtype {
    pub fn is_success(self) -> bool {
        matches!(self, ResultSubtype::Success)
    }
}
