//! Plugin middleware seam
//!
//! The bridge emits typed events at the points where external middleware may
//! observe or intervene: permission requests, user messages before send,
//! assistant output, results, tool lifecycle, status and MCP changes. The
//! middleware answers with insights (surfaced to browsers as `plugin_insight`
//! frames), an optional permission decision, an optional user-message
//! mutation, and an abort flag. A middleware failure is contained: the bridge
//! logs it, publishes one error-level insight, and takes the default path;
//! permission requests and user messages are never lost to a plugin fault.

use crate::bridge::types::{now_millis, BackendKind, ImageAttachment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names emitted by the bridge.
pub mod events {
    pub const SESSION_STATUS_CHANGED: &str = "session.status.changed";
    pub const SESSION_DISCONNECTED: &str = "session.disconnected";
    pub const MESSAGE_ASSISTANT: &str = "message.assistant";
    pub const RESULT_RECEIVED: &str = "result.received";
    pub const TOOL_STARTED: &str = "tool.started";
    pub const TOOL_FINISHED: &str = "tool.finished";
    pub const PERMISSION_REQUESTED: &str = "permission.requested";
    pub const PERMISSION_RESPONDED: &str = "permission.responded";
    pub const USER_MESSAGE_BEFORE_SEND: &str = "user.message.before_send";
    pub const USER_MESSAGE_SENT: &str = "user.message.sent";
    pub const MCP_STATUS_CHANGED: &str = "mcp.status.changed";
}

/// Typed event handed to the plugin manager.
#[derive(Debug, Clone, Serialize)]
pub struct PluginEvent {
    pub name: String,
    pub meta: PluginEventMeta,
    pub data: Value,
}

/// Event envelope metadata.
#[derive(Debug, Clone, Serialize)]
pub struct PluginEventMeta {
    pub event_id: String,
    pub timestamp: u64,
    pub source: String,
    pub session_id: String,
    pub backend_kind: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl PluginEvent {
    /// Build an event with a fresh id and current timestamp. `source` is
    /// "bridge" for primary sessions and "adapter" for subprocess sessions.
    pub fn new(
        name: &str,
        session_id: &str,
        backend_kind: BackendKind,
        correlation_id: Option<String>,
        data: Value,
    ) -> Self {
        let source = match backend_kind {
            BackendKind::Primary => "bridge",
            BackendKind::SubprocessAdapter => "adapter",
        };
        Self {
            name: name.to_string(),
            meta: PluginEventMeta {
                event_id: uuid::Uuid::new_v4().to_string(),
                timestamp: now_millis(),
                source: source.to_string(),
                session_id: session_id.to_string(),
                backend_kind,
                correlation_id,
            },
            data,
        }
    }
}

/// Insight surfaced to browsers as a `plugin_insight` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInsight {
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
}

impl PluginInsight {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            message: message.into(),
            plugin_id: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: "warning".to_string(),
            message: message.into(),
            plugin_id: None,
        }
    }
}

/// Automated verdict for a pending permission request.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionDecision {
    pub behavior: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub updated_input: Option<Value>,
    #[serde(default)]
    pub plugin_id: Option<String>,
}

/// Mutation (or block) of a user message before it reaches upstream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMessageMutation {
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<ImageAttachment>>,
}

/// Result of one middleware invocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginOutcome {
    #[serde(default)]
    pub insights: Vec<PluginInsight>,
    #[serde(default)]
    pub permission_decision: Option<PermissionDecision>,
    #[serde(default)]
    pub user_message_mutation: Option<UserMessageMutation>,
    #[serde(default)]
    pub aborted: bool,
}

/// External plugin middleware. Implementations may await I/O; the bridge
/// bounds nothing here and assumes the manager enforces its own timeouts.
#[async_trait]
pub trait PluginManager: Send + Sync {
    async fn emit(&self, event: PluginEvent) -> crate::Result<PluginOutcome>;
}
