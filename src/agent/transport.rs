//! Per-agent stream dialects.
//!
//! Each agent CLI prints one JSON object per line, but each names its tool
//! invocations differently. A [`Transport`] filters raw log lines and
//! recognizes its dialect's tool calls so the backend can emit one common
//! envelope for all of them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Tool an agent calls to park itself on a human answer.
pub const ASK_HUMAN_TOOL: &str = "ask_human";

/// Length of the stdout/stderr multiplexing header Docker prepends to frames.
const MUX_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
    pub call_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("not a tool call")]
pub struct NotAToolCall;

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Longest wait for the first line of output.
    fn init_timeout(&self) -> Duration;

    /// Longest silence tolerated once output has started.
    fn idle_timeout(&self) -> Duration;

    /// Normalize one raw line; `None` drops it.
    fn filter_output(&self, line: &[u8]) -> Option<String> {
        default_filter(line)
    }

    fn parse_tool_call(&self, raw: &Value) -> Result<ToolCall, NotAToolCall>;

    fn is_tool_result(&self, _raw: &Value) -> bool {
        false
    }
}

/// Strip exactly one multiplexing header when the first byte marks one.
pub fn strip_mux_header(line: &[u8]) -> &[u8] {
    match line.first() {
        Some(&b) if b < 0x20 && line.len() >= MUX_HEADER_LEN => &line[MUX_HEADER_LEN..],
        _ => line,
    }
}

/// Header stripping plus blank-line removal; what every dialect needs.
pub fn default_filter(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(strip_mux_header(line));
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn type_is(raw: &Value, expected: &str) -> bool {
    str_field(raw, "type") == Some(expected)
}

/// Build a call from the dialect's field names. A missing name is not a call.
fn tool_call_from(
    obj: &Value,
    name_key: &str,
    input_key: &str,
    id_keys: &[&str],
) -> Result<ToolCall, NotAToolCall> {
    let name = str_field(obj, name_key).ok_or(NotAToolCall)?;
    let call_id = id_keys
        .iter()
        .find_map(|k| str_field(obj, k))
        .unwrap_or_default();
    Ok(ToolCall {
        name: name.to_string(),
        input: obj.get(input_key).cloned().unwrap_or(Value::Null),
        call_id: call_id.to_string(),
    })
}

// ── Claude stream-json ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AssistantEnvelope {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        id: String,
    },
    #[serde(rename = "tool_result")]
    ToolResult,
    #[serde(other)]
    Other,
}

fn claude_content(raw: &Value) -> Vec<ContentBlock> {
    serde_json::from_value::<AssistantEnvelope>(raw.clone())
        .map(|env| env.message.content)
        .unwrap_or_default()
}

/// Claude emits `tool_use` either at top level or nested as a content
/// block of an `assistant` message.
fn claude_tool_call(raw: &Value) -> Result<ToolCall, NotAToolCall> {
    if type_is(raw, "tool_use") {
        return tool_call_from(raw, "name", "input", &["id"]);
    }
    if type_is(raw, "assistant") {
        return claude_content(raw)
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::ToolUse { name, input, id } => Some(ToolCall {
                    name,
                    input,
                    call_id: id,
                }),
                _ => None,
            })
            .ok_or(NotAToolCall);
    }
    Err(NotAToolCall)
}

fn claude_tool_result(raw: &Value) -> bool {
    type_is(raw, "tool_result")
        || (type_is(raw, "user")
            && claude_content(raw)
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult)))
}

// ── Codex exec --json ────────────────────────────────────────────────

fn codex_tool_call(raw: &Value) -> Result<ToolCall, NotAToolCall> {
    if !type_is(raw, "function_call") {
        return Err(NotAToolCall);
    }
    let mut call = tool_call_from(raw, "name", "arguments", &["id", "call_id"])?;
    // Arguments usually arrive as a JSON-encoded string.
    if let Value::String(encoded) = &call.input {
        if let Ok(decoded) = serde_json::from_str::<Value>(encoded) {
            call.input = decoded;
        }
    }
    Ok(call)
}

// ── OpenCode run --format json ───────────────────────────────────────

fn opencode_tool_call(raw: &Value) -> Result<ToolCall, NotAToolCall> {
    if !type_is(raw, "tool_call") {
        return Err(NotAToolCall);
    }
    tool_call_from(raw, "tool_name", "params", &["tool_id"])
}

// ── ACP (JSON-RPC over stdio) ────────────────────────────────────────

const ACP_DEBUG_PREFIX: &str = "acp: debug";

fn acp_tool_call(raw: &Value) -> Result<ToolCall, NotAToolCall> {
    if str_field(raw, "method") != Some("tool_call") {
        return Err(NotAToolCall);
    }
    let params = raw.get("params").ok_or(NotAToolCall)?;
    tool_call_from(params, "tool", "arguments", &["id"])
}

/// The `session/prompt` request that hands an ACP server its task.
pub fn acp_prompt_frame(prompt: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "session/prompt",
        "params": { "prompt": prompt },
    })
    .to_string()
}

// ── Agent kinds ──────────────────────────────────────────────────────

/// The supported agent CLIs, one transport dialect each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    OpenCode,
    Acp,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [Self::Acp, Self::Claude, Self::Codex, Self::OpenCode];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::OpenCode => "opencode",
            Self::Acp => "acp",
        }
    }

    /// Container command running the agent on `prompt`.
    pub fn command(&self, prompt: &str) -> Vec<String> {
        let parts: &[&str] = match self {
            Self::Claude => &["claude", "--output-format", "stream-json", "--verbose", "-p"],
            Self::Codex => &["codex", "exec", "--json"],
            Self::OpenCode => &["opencode", "run", "--format", "json"],
            Self::Acp => return vec!["acp-agent".to_string(), "--stdio".to_string()],
        };
        parts
            .iter()
            .map(|p| p.to_string())
            .chain(std::iter::once(prompt.to_string()))
            .collect()
    }

    /// Data written to the agent's stdin right after start, if the dialect
    /// takes its prompt that way.
    pub fn initial_stdin(&self, prompt: &str) -> Option<String> {
        match self {
            Self::Acp => Some(format!("{}\n", acp_prompt_frame(prompt))),
            _ => None,
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "opencode" => Ok(Self::OpenCode),
            "acp" => Ok(Self::Acp),
            _ => Err(format!("Invalid agent type: {}", s)),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Transport for AgentKind {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn init_timeout(&self) -> Duration {
        match self {
            Self::Claude => Duration::from_secs(30),
            Self::Codex => Duration::from_secs(60),
            Self::OpenCode => Duration::from_secs(45),
            Self::Acp => Duration::from_secs(60),
        }
    }

    fn idle_timeout(&self) -> Duration {
        match self {
            Self::Claude => Duration::from_secs(10 * 60),
            Self::Codex => Duration::from_secs(15 * 60),
            Self::OpenCode => Duration::from_secs(10 * 60),
            Self::Acp => Duration::from_secs(5 * 60),
        }
    }

    fn filter_output(&self, line: &[u8]) -> Option<String> {
        let line = default_filter(line)?;
        if *self == Self::Acp && line.starts_with(ACP_DEBUG_PREFIX) {
            return None;
        }
        Some(line)
    }

    fn parse_tool_call(&self, raw: &Value) -> Result<ToolCall, NotAToolCall> {
        match self {
            Self::Claude => claude_tool_call(raw),
            Self::Codex => codex_tool_call(raw),
            Self::OpenCode => opencode_tool_call(raw),
            Self::Acp => acp_tool_call(raw),
        }
    }

    fn is_tool_result(&self, raw: &Value) -> bool {
        match self {
            Self::Claude => claude_tool_result(raw),
            Self::Codex => type_is(raw, "function_call_output"),
            Self::OpenCode => type_is(raw, "tool_result"),
            Self::Acp => str_field(raw, "method") == Some("tool_result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_strips_mux_header() {
        let mut line = vec![1u8, 0, 0, 0, 0, 0, 0, 12];
        line.extend_from_slice(b"{\"a\":1}");
        assert_eq!(
            AgentKind::Claude.filter_output(&line).as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[test]
    fn test_filter_keeps_plain_lines() {
        assert_eq!(
            AgentKind::Codex.filter_output(b"  hello world \r").as_deref(),
            Some("hello world")
        );
    }

    #[test]
    fn test_filter_drops_blank_lines() {
        assert_eq!(AgentKind::Claude.filter_output(b""), None);
        assert_eq!(AgentKind::Claude.filter_output(b"   \t "), None);
        // A header followed by nothing is blank too.
        assert_eq!(AgentKind::Claude.filter_output(&[2, 0, 0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn test_acp_drops_debug_lines() {
        assert_eq!(AgentKind::Acp.filter_output(b"acp: debug handshake ok"), None);
        assert!(AgentKind::Claude
            .filter_output(b"acp: debug handshake ok")
            .is_some());
    }

    #[test]
    fn test_claude_top_level_tool_use() {
        let raw = json!({"type": "tool_use", "name": "ask_human", "input": {"question": "Q?"}, "id": "tu_1"});
        let call = AgentKind::Claude.parse_tool_call(&raw).unwrap();
        assert_eq!(call.name, "ask_human");
        assert_eq!(call.input, json!({"question": "Q?"}));
        assert_eq!(call.call_id, "tu_1");
    }

    #[test]
    fn test_claude_nested_tool_use() {
        let raw = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Let me ask."},
                {"type": "tool_use", "name": "Bash", "input": {"command": "ls"}, "id": "tu_2"}
            ]}
        });
        let call = AgentKind::Claude.parse_tool_call(&raw).unwrap();
        assert_eq!(call.name, "Bash");
        assert_eq!(call.call_id, "tu_2");
    }

    #[test]
    fn test_claude_text_is_not_a_tool_call() {
        let raw = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "hi"}]}});
        assert_eq!(AgentKind::Claude.parse_tool_call(&raw), Err(NotAToolCall));
    }

    #[test]
    fn test_claude_tool_result() {
        let raw = json!({"type": "user", "message": {"content": [{"type": "tool_result", "content": "ok"}]}});
        assert!(AgentKind::Claude.is_tool_result(&raw));
        assert!(!AgentKind::Claude.is_tool_result(&json!({"type": "system"})));
    }

    #[test]
    fn test_codex_function_call_decodes_arguments() {
        let raw = json!({"type": "function_call", "name": "ask_human", "arguments": "{\"question\":\"Which DB?\"}", "id": "fc_1"});
        let call = AgentKind::Codex.parse_tool_call(&raw).unwrap();
        assert_eq!(call.name, "ask_human");
        assert_eq!(call.input, json!({"question": "Which DB?"}));
        assert_eq!(call.call_id, "fc_1");
    }

    #[test]
    fn test_codex_rejects_other_dialects() {
        let raw = json!({"type": "tool_use", "name": "x", "input": {}, "id": "1"});
        assert_eq!(AgentKind::Codex.parse_tool_call(&raw), Err(NotAToolCall));
    }

    #[test]
    fn test_opencode_tool_call() {
        let raw = json!({"type": "tool_call", "tool_name": "edit", "params": {"path": "a.rs"}, "tool_id": "t9"});
        let call = AgentKind::OpenCode.parse_tool_call(&raw).unwrap();
        assert_eq!(call.name, "edit");
        assert_eq!(call.input, json!({"path": "a.rs"}));
        assert_eq!(call.call_id, "t9");
    }

    #[test]
    fn test_acp_tool_call() {
        let raw = json!({"jsonrpc": "2.0", "method": "tool_call", "params": {"tool": "ask_human", "arguments": {"question": "Ship it?"}, "id": "a1"}});
        let call = AgentKind::Acp.parse_tool_call(&raw).unwrap();
        assert_eq!(call.name, "ask_human");
        assert_eq!(call.input, json!({"question": "Ship it?"}));
        assert_eq!(call.call_id, "a1");
    }

    #[test]
    fn test_missing_name_is_not_a_tool_call() {
        let raw = json!({"type": "tool_call", "params": {}});
        assert_eq!(AgentKind::OpenCode.parse_tool_call(&raw), Err(NotAToolCall));
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            AgentKind::Claude.command("fix it"),
            vec!["claude", "--output-format", "stream-json", "--verbose", "-p", "fix it"]
        );
        assert_eq!(
            AgentKind::Codex.command("fix it"),
            vec!["codex", "exec", "--json", "fix it"]
        );
        assert_eq!(AgentKind::Acp.command("fix it"), vec!["acp-agent", "--stdio"]);
    }

    #[test]
    fn test_acp_prompt_goes_through_stdin() {
        let frame = AgentKind::Acp.initial_stdin("fix it").unwrap();
        assert!(frame.ends_with('\n'));
        let parsed: Value = serde_json::from_str(frame.trim_end()).unwrap();
        assert_eq!(parsed["method"], "session/prompt");
        assert_eq!(parsed["params"]["prompt"], "fix it");
        assert!(AgentKind::Claude.initial_stdin("fix it").is_none());
    }

    #[test]
    fn test_timeouts_within_bounds() {
        for kind in AgentKind::ALL {
            let init = kind.init_timeout().as_secs();
            let idle = kind.idle_timeout().as_secs();
            assert!((30..=60).contains(&init), "{kind} init {init}");
            assert!((300..=900).contains(&idle), "{kind} idle {idle}");
        }
    }

    #[test]
    fn test_kind_roundtrip() {
        for s in &["claude", "codex", "opencode", "acp"] {
            let parsed: AgentKind = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("gpt".parse::<AgentKind>().is_err());
    }
}
