//! Agent Client Protocol wire types and their mapping onto [`RunnerEvent`]s.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::acp::events::{RunnerEvent, ToolCallEvent, ToolPhase};

pub const PROTOCOL_VERSION: u64 = 1;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_SET_MODEL: &str = "session/set_model";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
pub const METHOD_SESSION_UPDATE: &str = "session/update";
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const PARSE_ERROR: i64 = -32700;

/// MCP server forwarded to every new session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServer {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl McpServer {
    /// Wire form: `env` is a list of `{name, value}` pairs.
    pub fn to_wire(&self) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        json!({
            "name": self.name,
            "command": self.command,
            "args": self.args,
            "env": env,
        })
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": { "readTextFile": false, "writeTextFile": false },
            "terminal": false,
        },
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCallContent {
    Diff {
        path: PathBuf,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub content: Vec<ToolCallContent>,
}

/// Payload of `session/update`. Update kinds this client does not act on
/// decode as [`SessionUpdate::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk { content: ContentBlock },
    AgentThoughtChunk { content: ContentBlock },
    ToolCall(ToolCall),
    ToolCallUpdate(ToolCall),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: SessionUpdate,
}

/// Translate one session update into listener events, preserving order.
pub fn runner_events(update: SessionUpdate) -> Vec<RunnerEvent> {
    match update {
        SessionUpdate::AgentMessageChunk { content } => content
            .as_text()
            .map(|text| vec![RunnerEvent::Text(text.to_string())])
            .unwrap_or_default(),
        SessionUpdate::AgentThoughtChunk { content } => content
            .as_text()
            .map(|text| vec![RunnerEvent::Thinking(text.to_string())])
            .unwrap_or_default(),
        SessionUpdate::ToolCall(call) => tool_events(call, ToolPhase::Started),
        SessionUpdate::ToolCallUpdate(call) => {
            let phase = match call.status.as_deref() {
                Some("completed") => ToolPhase::Completed,
                Some("failed") => ToolPhase::Failed,
                _ => ToolPhase::Updated,
            };
            tool_events(call, phase)
        }
        SessionUpdate::Other => Vec::new(),
    }
}

fn tool_events(call: ToolCall, phase: ToolPhase) -> Vec<RunnerEvent> {
    let mut paths: Vec<PathBuf> = Vec::new();
    if phase == ToolPhase::Started
        && matches!(call.kind.as_deref(), Some("edit" | "delete" | "move"))
    {
        paths.extend(call.locations.iter().map(|loc| loc.path.clone()));
    }
    for item in &call.content {
        if let ToolCallContent::Diff { path } = item {
            paths.push(path.clone());
        }
    }
    paths.dedup();

    let mut events = vec![RunnerEvent::ToolCall(ToolCallEvent {
        id: call.tool_call_id,
        title: call.title,
        kind: call.kind,
        phase,
        status: call.status,
    })];
    events.extend(paths.into_iter().map(RunnerEvent::FileChange));
    events
}

/// JSON-RPC error object returned for agent requests we refuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionOption {
    option_id: String,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct PermissionRequest {
    #[serde(default)]
    options: Vec<PermissionOption>,
}

/// Answer a request initiated by the agent.
///
/// Permission prompts are granted with the first `allow_*` option, falling
/// back to the first option offered. Everything else is unsupported.
pub fn answer_agent_request(method: &str, params: &Value) -> Result<Value, RpcErrorObject> {
    if method != METHOD_REQUEST_PERMISSION {
        return Err(RpcErrorObject {
            code: METHOD_NOT_FOUND,
            message: format!("method not supported by client: {method}"),
        });
    }
    let request: PermissionRequest =
        serde_json::from_value(params.clone()).map_err(|err| RpcErrorObject {
            code: INVALID_PARAMS,
            message: format!("invalid permission request: {err}"),
        })?;
    let chosen = request
        .options
        .iter()
        .find(|opt| opt.kind.starts_with("allow"))
        .or_else(|| request.options.first());
    match chosen {
        Some(option) => Ok(json!({
            "outcome": { "outcome": "selected", "optionId": option.option_id }
        })),
        None => Ok(json!({ "outcome": { "outcome": "cancelled" } })),
    }
}
