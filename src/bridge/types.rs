//! Wire protocol types for the session bridge
//!
//! Three vocabularies meet here:
//! - Upstream (CLI) ↔ bridge: newline-delimited JSON, one message per line
//! - Bridge → browser: JSON frames, tagged with a per-session sequence number
//! - Browser → bridge: JSON commands, optionally carrying `client_msg_id`
//!
//! Plus the session snapshot, history entries, and the persisted session
//! schema that survives server restarts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replay ring capacity.
pub const EVENT_BUFFER_LIMIT: usize = 600;

/// Processed client message id FIFO capacity.
pub const PROCESSED_CLIENT_MSG_ID_LIMIT: usize = 1000;

/// Soft cap on in-memory history entries.
pub const HISTORY_SOFT_LIMIT: usize = 400;

// =============================================================================
// Upstream (CLI) → bridge messages (NDJSON)
// =============================================================================

/// Top-level upstream message, parsed from one NDJSON line.
///
/// Unrecognized `type` tags deserialize to [`UpstreamMessage::Unknown`] so a
/// newer CLI never breaks the stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamMessage {
    System(SystemMessage),
    Assistant(AssistantEnvelope),
    Result(ResultMessage),
    StreamEvent(StreamEventMessage),
    ControlRequest(ControlRequestMessage),
    ControlResponse(ControlResponseMessage),
    ToolProgress(ToolProgressMessage),
    ToolUseSummary(ToolUseSummaryMessage),
    AuthStatus(AuthStatusMessage),
    KeepAlive,
    #[serde(other)]
    Unknown,
}

/// System message (subtype: "init" or "status")
#[derive(Debug, Clone, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    pub session_id: Option<String>,
    // init fields
    pub cwd: Option<String>,
    pub tools: Option<Vec<String>>,
    pub model: Option<String>,
    #[serde(rename = "permissionMode")]
    pub permission_mode: Option<String>,
    pub version: Option<String>,
    pub mcp_servers: Option<Vec<McpServer>>,
    pub agents: Option<Vec<String>>,
    pub slash_commands: Option<Vec<String>>,
    pub skills: Option<Vec<String>>,
    // status fields
    pub status: Option<String>,
}

/// MCP server info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub status: String,
}

/// Complete assistant turn from the CLI
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEnvelope {
    pub message: AssistantMessage,
    pub parent_tool_use_id: Option<String>,
}

/// Body of an assistant message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Value>,
}

/// Content block within an assistant message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        budget_tokens: Option<u32>,
    },
}

impl AssistantMessage {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Names of all tool_use blocks, in order.
    pub fn tool_names(&self) -> Vec<String> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Result message (turn completion)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    pub result: Option<String>,
    pub errors: Option<Vec<String>>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub total_cost_usd: Option<f64>,
    pub stop_reason: Option<String>,
    #[serde(rename = "modelUsage")]
    pub model_usage: Option<Value>,
    pub total_lines_added: Option<u32>,
    pub total_lines_removed: Option<u32>,
}

/// Raw model stream event; broadcast verbatim, never stored
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventMessage {
    pub event: Value,
    pub parent_tool_use_id: Option<String>,
}

/// Control request from upstream (permission prompt)
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestMessage {
    pub request_id: String,
    pub request: ControlRequestBody,
}

/// Body of an upstream control request
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequestBody {
    pub subtype: String,
    pub tool_name: Option<String>,
    pub input: Option<Value>,
    pub permission_suggestions: Option<Vec<Value>>,
    pub description: Option<String>,
    pub tool_use_id: Option<String>,
    pub agent_id: Option<String>,
}

/// Typed response to a bridge-initiated control request
#[derive(Debug, Clone, Deserialize)]
pub struct ControlResponseMessage {
    pub response: ControlResponseBody,
}

/// Body of an upstream control response
#[derive(Debug, Clone, Deserialize)]
pub struct ControlResponseBody {
    pub subtype: String,
    pub request_id: String,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Tool progress heartbeat
#[derive(Debug, Clone, Deserialize)]
pub struct ToolProgressMessage {
    pub tool_use_id: String,
    pub tool_name: String,
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub elapsed_time_seconds: f64,
}

/// Tool use summary, closing out one or more preceding tool uses
#[derive(Debug, Clone, Deserialize)]
pub struct ToolUseSummaryMessage {
    pub summary: String,
    #[serde(default)]
    pub preceding_tool_use_ids: Vec<String>,
}

/// Authentication progress from upstream
#[derive(Debug, Clone, Deserialize)]
pub struct AuthStatusMessage {
    #[serde(rename = "isAuthenticating", default)]
    pub is_authenticating: bool,
    #[serde(default)]
    pub output: Vec<String>,
    pub error: Option<String>,
}

// =============================================================================
// Bridge → browser frames (JSON)
// =============================================================================

/// Frame sent to browser clients.
///
/// Every frame emitted through the event sequencer additionally carries a
/// `seq` field, injected at serialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserFrame {
    SessionInit {
        session: SessionSnapshot,
    },
    SessionUpdate {
        session: Value,
    },
    Assistant {
        message: AssistantMessage,
        parent_tool_use_id: Option<String>,
    },
    StreamEvent {
        event: Value,
        parent_tool_use_id: Option<String>,
    },
    Result {
        data: Value,
    },
    PermissionRequest {
        request: PermissionRequest,
    },
    PermissionCancelled {
        request_id: String,
    },
    ToolProgress {
        tool_use_id: String,
        tool_name: String,
        elapsed_time_seconds: f64,
    },
    ToolUseSummary {
        summary: String,
        tool_use_ids: Vec<String>,
    },
    StatusChange {
        status: Option<String>,
    },
    AuthStatus {
        is_authenticating: bool,
        output: Vec<String>,
        error: Option<String>,
    },
    Error {
        message: String,
    },
    CliConnected,
    CliDisconnected,
    UserMessage {
        id: String,
        content: String,
        timestamp: u64,
    },
    MessageHistory {
        messages: Vec<BrowserFrame>,
    },
    EventReplay {
        events: Vec<Value>,
    },
    PluginInsight {
        insight: crate::bridge::plugin::PluginInsight,
    },
    McpStatus {
        servers: Vec<McpServer>,
    },
    SessionNameUpdate {
        name: String,
    },
}

/// Frame kinds already recoverable from the history log. Everything else in
/// the replay ring counts as transient for gap repair.
pub fn is_history_backed(frame_type: &str) -> bool {
    matches!(frame_type, "assistant" | "result" | "user_message" | "error")
}

// =============================================================================
// Browser → bridge commands (JSON)
// =============================================================================

/// Command received from browser clients.
///
/// The `Serialize` derive reconstructs the original wire form, which is what
/// gets forwarded verbatim to subprocess adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserCommand {
    UserMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImageAttachment>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    PermissionResponse {
        request_id: String,
        behavior: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_permissions: Option<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    SetModel {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    SetPermissionMode {
        mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpGetStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpToggle {
        server_name: String,
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpReconnect {
        server_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    McpSetServers {
        servers: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<String>,
    },
    SessionSubscribe {
        last_seq: u64,
    },
    SessionAck {
        last_seq: u64,
    },
}

impl BrowserCommand {
    /// Client-assigned retry id, when present.
    pub fn client_msg_id(&self) -> Option<&str> {
        match self {
            Self::UserMessage { client_msg_id, .. }
            | Self::PermissionResponse { client_msg_id, .. }
            | Self::Interrupt { client_msg_id }
            | Self::SetModel { client_msg_id, .. }
            | Self::SetPermissionMode { client_msg_id, .. }
            | Self::McpGetStatus { client_msg_id }
            | Self::McpToggle { client_msg_id, .. }
            | Self::McpReconnect { client_msg_id, .. }
            | Self::McpSetServers { client_msg_id, .. } => client_msg_id.as_deref(),
            Self::SessionSubscribe { .. } | Self::SessionAck { .. } => None,
        }
    }
}

/// Base64 image attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

// =============================================================================
// Session state and history
// =============================================================================

/// Upstream backend flavor of a session. Monotone after first set: a session
/// switches to `SubprocessAdapter` only on explicit adapter attachment and
/// never silently reverts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Primary,
    SubprocessAdapter,
}

/// UI-visible session state, populated from upstream init/status/result
/// messages and repository metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mcp_servers: Vec<McpServer>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub context_used_percent: f64,
    #[serde(default)]
    pub is_compacting: bool,
    #[serde(default)]
    pub git_branch: String,
    #[serde(default)]
    pub is_worktree: bool,
    #[serde(default)]
    pub repo_root: String,
    #[serde(default)]
    pub git_ahead: u32,
    #[serde(default)]
    pub git_behind: u32,
    #[serde(default)]
    pub total_lines_added: u32,
    #[serde(default)]
    pub total_lines_removed: u32,
}

fn default_permission_mode() -> String {
    "default".to_string()
}

impl SessionSnapshot {
    /// Create an empty snapshot for a fresh session.
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            backend_kind: BackendKind::Primary,
            model: String::new(),
            cwd: String::new(),
            tools: Vec::new(),
            permission_mode: default_permission_mode(),
            version: String::new(),
            mcp_servers: Vec::new(),
            agents: Vec::new(),
            slash_commands: Vec::new(),
            skills: Vec::new(),
            total_cost_usd: 0.0,
            num_turns: 0,
            context_used_percent: 0.0,
            is_compacting: false,
            git_branch: String::new(),
            is_worktree: false,
            repo_root: String::new(),
            git_ahead: 0,
            git_behind: 0,
            total_lines_added: 0,
            total_lines_removed: 0,
        }
    }
}

/// Unanswered `can_use_tool` request from upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    pub permission_suggestions: Option<Vec<Value>>,
    pub description: Option<String>,
    pub tool_use_id: Option<String>,
    pub agent_id: Option<String>,
    pub timestamp: u64,
}

/// Durable conversation history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    User {
        id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<ImageAttachment>>,
        timestamp: u64,
    },
    Assistant {
        message: AssistantMessage,
        parent_tool_use_id: Option<String>,
    },
    Result {
        data: Value,
    },
    SystemError {
        message: String,
    },
}

impl HistoryEntry {
    /// Render this entry as the browser frame used in history replays.
    pub fn to_frame(&self) -> BrowserFrame {
        match self {
            Self::User {
                id,
                content,
                timestamp,
                ..
            } => BrowserFrame::UserMessage {
                id: id.clone(),
                content: content.clone(),
                timestamp: *timestamp,
            },
            Self::Assistant {
                message,
                parent_tool_use_id,
            } => BrowserFrame::Assistant {
                message: message.clone(),
                parent_tool_use_id: parent_tool_use_id.clone(),
            },
            Self::Result { data } => BrowserFrame::Result { data: data.clone() },
            Self::SystemError { message } => BrowserFrame::Error {
                message: message.clone(),
            },
        }
    }
}

// =============================================================================
// Persistence schema
// =============================================================================

/// One entry of the replay ring: the exact JSON payload that was broadcast,
/// `seq` field included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedEvent {
    pub seq: u64,
    pub frame: Value,
}

/// Per-session record written to disk. Unknown fields are tolerated on read;
/// fields added after the first release default to empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: String,
    pub state: SessionSnapshot,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub outbound_queue: Vec<String>,
    #[serde(default)]
    pub pending_perms: Vec<(String, PermissionRequest)>,
    #[serde(default)]
    pub event_buffer: Vec<BufferedEvent>,
    #[serde(default = "default_next_seq")]
    pub next_seq: u64,
    #[serde(default)]
    pub last_ack_seq: u64,
    #[serde(default)]
    pub processed_client_ids: Vec<String>,
}

fn default_next_seq() -> u64 {
    1
}

// =============================================================================
// NDJSON helpers
// =============================================================================

/// Assembles complete NDJSON lines from arbitrarily chunked input.
///
/// A partial trailing line is retained across calls; [`LineAssembler::finish`]
/// surfaces whatever is left when the stream closes.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete, non-blank line it closed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Remaining partial line, if any non-blank bytes are buffered.
    pub fn finish(self) -> Option<String> {
        let rest = self.buffer.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

/// Parse one NDJSON line into an upstream message. Malformed lines are
/// logged once and dropped; the rest of the stream continues.
pub fn parse_upstream_line(line: &str) -> Option<UpstreamMessage> {
    match serde_json::from_str::<UpstreamMessage>(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            let preview = &line[..line.len().min(200)];
            tracing::warn!("NDJSON parse error: {} (line: {})", e, preview);
            None
        }
    }
}

/// Parse a chunk of NDJSON data, skipping blank and malformed lines.
pub fn parse_ndjson(data: &str) -> Vec<UpstreamMessage> {
    data.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(parse_upstream_line)
        .collect()
}

/// Compute context usage percentage from `modelUsage`, clamped to 0..100.
pub fn compute_context_percent(model_usage: &Value) -> f64 {
    if let Some(obj) = model_usage.as_object() {
        for usage in obj.values() {
            let input = usage
                .get("inputTokens")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let output = usage
                .get("outputTokens")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let context_window = usage
                .get("contextWindow")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);

            if context_window > 0.0 {
                let percent = (input + output) / context_window * 100.0;
                return percent.clamp(0.0, 100.0);
            }
        }
    }
    0.0
}

// =============================================================================
// Upstream wire builders
// =============================================================================

/// Build the upstream `user` frame: plain string content, or a block array
/// when images are attached.
pub fn user_wire(
    content: &str,
    images: &Option<Vec<ImageAttachment>>,
    cli_session_id: &Option<String>,
) -> Value {
    let message_content = match images {
        Some(imgs) if !imgs.is_empty() => {
            let mut blocks: Vec<Value> = imgs
                .iter()
                .map(|img| {
                    serde_json::json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": img.media_type,
                            "data": img.data,
                        }
                    })
                })
                .collect();
            blocks.push(serde_json::json!({ "type": "text", "text": content }));
            Value::Array(blocks)
        }
        _ => Value::String(content.to_string()),
    };

    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": message_content,
        },
        "parent_tool_use_id": null,
        "session_id": cli_session_id,
    })
}

/// Build an allow control response toward upstream.
pub fn allow_response_wire(
    request_id: &str,
    updated_input: &Value,
    updated_permissions: &Option<Vec<Value>>,
) -> Value {
    let mut response = serde_json::json!({
        "behavior": "allow",
        "updatedInput": updated_input,
    });
    if let Some(perms) = updated_permissions {
        response["updatedPermissions"] = Value::Array(perms.clone());
    }

    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        }
    })
}

/// Build a deny control response toward upstream.
pub fn deny_response_wire(request_id: &str, message: &str) -> Value {
    serde_json::json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": {
                "behavior": "deny",
                "message": message,
            }
        }
    })
}

/// Build a bridge-initiated control request with a fresh request id.
/// Returns the id alongside the frame so callers can await a typed response.
pub fn control_request_wire(request: Value) -> (String, Value) {
    let request_id = uuid::Uuid::new_v4().to_string();
    let frame = serde_json::json!({
        "type": "control_request",
        "request_id": request_id,
        "request": request,
    });
    (request_id, frame)
}

/// Current time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
