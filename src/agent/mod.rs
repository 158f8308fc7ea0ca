//! Agent backends: containerized agent CLIs behind one session interface.
//!
//! | Module      | Contents                                              |
//! |-------------|-------------------------------------------------------|
//! | `transport` | Per-dialect line filtering and tool-call parsing      |
//! | `backend`   | `ContainerBackend`, the per-session stream reader     |
//! | `registry`  | Agent-type name → backend factory                     |

pub mod backend;
pub mod registry;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::errors::AgentError;

pub use backend::ContainerBackend;
pub use registry::{BackendFactory, Registry};
pub use transport::{ASK_HUMAN_TOOL, AgentKind, NotAToolCall, ToolCall, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Output,
    ToolCall,
    ToolResult,
    Error,
    Status,
}

/// Normalized envelope for one line of agent output, whatever the dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: Uuid,
    pub content: String,
    /// The parsed JSON line; `null` when the line was not JSON.
    pub raw: Value,
    pub timestamp: DateTime<Utc>,
    /// Parsed call for `tool_call` envelopes. Not part of the wire payload.
    #[serde(skip)]
    pub tool_call: Option<ToolCall>,
}

impl AgentMessage {
    pub fn new(kind: MessageType, session_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            kind,
            session_id,
            content: content.into(),
            raw: Value::Null,
            timestamp: Utc::now(),
            tool_call: None,
        }
    }

    /// Classify one filtered line: a dialect tool call, a tool result, or
    /// plain output. Lines that are not JSON become output with `raw = null`.
    pub fn from_line(transport: &dyn Transport, session_id: Uuid, line: String) -> Self {
        let Ok(raw) = serde_json::from_str::<Value>(&line) else {
            return Self::new(MessageType::Output, session_id, line);
        };

        let mut msg = match transport.parse_tool_call(&raw) {
            Ok(call) => {
                let mut msg = Self::new(MessageType::ToolCall, session_id, call.name.clone());
                msg.tool_call = Some(call);
                msg
            }
            Err(NotAToolCall) if transport.is_tool_result(&raw) => {
                Self::new(MessageType::ToolResult, session_id, line)
            }
            Err(NotAToolCall) => Self::new(MessageType::Output, session_id, line),
        };
        msg.raw = raw;
        msg
    }

    pub fn is_ask_human(&self) -> bool {
        self.tool_call
            .as_ref()
            .is_some_and(|call| call.name == ASK_HUMAN_TOOL)
    }
}

/// Everything a backend needs to launch one session's container.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_id: Uuid,
    pub tenant_id: Uuid,
    pub prompt: String,
    /// Overrides the backend's configured image.
    pub image: Option<String>,
    pub volume_name: String,
    pub mount_path: String,
    pub work_dir: String,
    pub branch_name: String,
    pub env: HashMap<String, String>,
}

/// A launched session. `stream_done` fires once the reader has delivered
/// its last envelope.
#[derive(Debug)]
pub struct StartedSession {
    pub container_id: String,
    pub stream_done: oneshot::Receiver<()>,
}

/// Receives every envelope of every session a backend runs. Called from
/// many stream readers at once; each reader awaits its own deliveries in
/// order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: AgentMessage);
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn agent_type(&self) -> &str;

    async fn start_session(&self, opts: SessionOptions) -> Result<StartedSession, AgentError>;

    /// Write `text` plus a newline to the session's agent stdin.
    async fn send_prompt(&self, session_id: Uuid, text: &str) -> Result<(), AgentError>;

    /// Re-arm the idle timeout after an `ask_human` call that will not be
    /// answered.
    async fn resume_idle(&self, session_id: Uuid) -> Result<(), AgentError>;

    /// Stop the container and end the session's stream reader.
    async fn cancel(&self, session_id: Uuid) -> Result<(), AgentError>;

    fn on_message(&self, handler: Arc<dyn MessageHandler>);

    /// Cancel, stop and remove every session; returns the first error.
    async fn dispose(&self) -> Result<(), AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_json_line_is_output_with_null_raw() {
        let id = Uuid::new_v4();
        let msg = AgentMessage::from_line(&AgentKind::Claude, id, "Compiling aira v0.1.0".into());
        assert_eq!(msg.kind, MessageType::Output);
        assert_eq!(msg.content, "Compiling aira v0.1.0");
        assert_eq!(msg.raw, Value::Null);
        assert_eq!(msg.session_id, id);
    }

    #[test]
    fn test_tool_call_line() {
        let line = json!({"type": "tool_use", "name": "ask_human", "input": {"question": "Q?"}, "id": "t"})
            .to_string();
        let msg = AgentMessage::from_line(&AgentKind::Claude, Uuid::new_v4(), line);
        assert_eq!(msg.kind, MessageType::ToolCall);
        assert_eq!(msg.content, "ask_human");
        assert!(msg.is_ask_human());
        assert_eq!(msg.raw["id"], "t");
    }

    #[test]
    fn test_foreign_dialect_is_output() {
        let line = json!({"type": "function_call", "name": "ask_human", "arguments": "{}"}).to_string();
        let msg = AgentMessage::from_line(&AgentKind::Claude, Uuid::new_v4(), line);
        assert_eq!(msg.kind, MessageType::Output);
        assert!(!msg.is_ask_human());
        assert_eq!(msg.raw["type"], "function_call");
    }

    #[test]
    fn test_tool_result_line() {
        let line = json!({"type": "function_call_output", "output": "ok"}).to_string();
        let msg = AgentMessage::from_line(&AgentKind::Codex, Uuid::new_v4(), line);
        assert_eq!(msg.kind, MessageType::ToolResult);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = AgentMessage::new(MessageType::Status, Uuid::nil(), "started");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["content"], "started");
        assert_eq!(value["raw"], Value::Null);
        assert!(value.get("tool_call").is_none());
        assert!(value.get("timestamp").is_some());
    }
}
