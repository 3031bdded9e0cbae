//! Browser message routing
//!
//! Every inbound browser command passes the same gauntlet: the subscribe/ack
//! fast path first (those frames carry no client id and must never be
//! filtered), then the idempotency gate, then dispatch. User messages detour
//! through the session's serializer so plugin middleware observes them in
//! strict arrival order; on subprocess-adapter sessions the control surface
//! is forwarded to the adapter instead of the CLI socket.

use crate::bridge::hub::Hub;
use crate::bridge::plugin::{events, PluginInsight};
use crate::bridge::serializer::QueuedUserMessage;
use crate::bridge::session::Session;
use crate::bridge::types::{
    allow_response_wire, control_request_wire, deny_response_wire, now_millis, user_wire,
    BackendKind, BrowserCommand, BrowserFrame, HistoryEntry, McpServer,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Status refresh delays after MCP mutations, giving upstream time to apply.
const MCP_TOGGLE_REFRESH: Duration = Duration::from_millis(500);
const MCP_RECONNECT_REFRESH: Duration = Duration::from_millis(1000);
const MCP_SET_SERVERS_REFRESH: Duration = Duration::from_millis(2000);

enum Upstream {
    Cli,
    Adapter(crate::bridge::adapter::AdapterHandle),
    Detached,
}

impl Hub {
    /// Route one browser command for a connected browser socket.
    pub async fn route_browser_message(
        self: &Arc<Self>,
        session_id: &str,
        browser_id: &str,
        command: BrowserCommand,
    ) {
        let session = match self.get(session_id).await {
            Some(s) => s,
            None => {
                tracing::warn!(session_id, "Browser message for unknown session");
                return;
            }
        };

        // Subscribe/ack fast path: processed before any filtering
        match &command {
            BrowserCommand::SessionSubscribe { last_seq } => {
                self.on_subscribe(&session, browser_id, *last_seq).await;
                return;
            }
            BrowserCommand::SessionAck { last_seq } => {
                self.on_ack(&session, browser_id, *last_seq).await;
                return;
            }
            _ => {}
        }

        // Idempotency gate for mutating commands carrying a client id
        if let Some(client_id) = command.client_msg_id() {
            let duplicate = {
                let mut inner = session.inner.lock().await;
                if inner.ledger.seen(client_id) {
                    true
                } else {
                    inner.ledger.remember(client_id);
                    false
                }
            };
            if duplicate {
                tracing::debug!(
                    session_id,
                    client_msg_id = client_id,
                    "Dropping duplicate browser message"
                );
                return;
            }
            self.persist_session(&session).await;
        }

        let raw = serde_json::to_value(&command).unwrap_or_default();
        let adapter_session = {
            session.inner.lock().await.state.backend_kind == BackendKind::SubprocessAdapter
        };

        match command {
            BrowserCommand::UserMessage {
                content, images, ..
            } => {
                // Strict ordering through the per-session serializer
                if !session.serializer.enqueue(QueuedUserMessage {
                    content,
                    images,
                    raw,
                }) {
                    tracing::warn!(session_id, "User message worker unavailable");
                }
            }
            BrowserCommand::PermissionResponse {
                request_id,
                behavior,
                updated_input,
                updated_permissions,
                message,
                ..
            } => {
                self.on_permission_response(
                    &session,
                    adapter_session,
                    raw,
                    request_id,
                    behavior,
                    updated_input,
                    updated_permissions,
                    message,
                )
                .await;
            }
            BrowserCommand::Interrupt { .. } => {
                self.send_control(&session, adapter_session, raw, serde_json::json!({
                    "subtype": "interrupt",
                }))
                .await;
            }
            BrowserCommand::SetModel { ref model, .. } => {
                self.send_control(&session, adapter_session, raw.clone(), serde_json::json!({
                    "subtype": "set_model",
                    "model": model,
                }))
                .await;
            }
            BrowserCommand::SetPermissionMode { ref mode, .. } => {
                self.send_control(&session, adapter_session, raw.clone(), serde_json::json!({
                    "subtype": "set_permission_mode",
                    "mode": mode,
                }))
                .await;
            }
            BrowserCommand::McpGetStatus { .. } => {
                if adapter_session {
                    self.forward_to_adapter(&session, raw).await;
                } else {
                    self.request_mcp_status(&session).await;
                    self.persist_session(&session).await;
                }
            }
            BrowserCommand::McpToggle {
                ref server_name,
                enabled,
                ..
            } => {
                self.send_control(&session, adapter_session, raw.clone(), serde_json::json!({
                    "subtype": "mcp_toggle",
                    "server_name": server_name,
                    "enabled": enabled,
                }))
                .await;
                self.schedule_mcp_refresh(&session.id, MCP_TOGGLE_REFRESH);
            }
            BrowserCommand::McpReconnect {
                ref server_name, ..
            } => {
                self.send_control(&session, adapter_session, raw.clone(), serde_json::json!({
                    "subtype": "mcp_reconnect",
                    "server_name": server_name,
                }))
                .await;
                self.schedule_mcp_refresh(&session.id, MCP_RECONNECT_REFRESH);
            }
            BrowserCommand::McpSetServers { ref servers, .. } => {
                self.send_control(&session, adapter_session, raw.clone(), serde_json::json!({
                    "subtype": "mcp_set_servers",
                    "servers": servers,
                }))
                .await;
                self.schedule_mcp_refresh(&session.id, MCP_SET_SERVERS_REFRESH);
            }
            BrowserCommand::SessionSubscribe { .. } | BrowserCommand::SessionAck { .. } => {
                // Handled on the fast path above
            }
        }
    }

    // =========================================================================
    // Subscribe / ack
    // =========================================================================

    /// Replay what the browser missed. Three regimes: nothing missed, the
    /// ring covers the gap, or the gap predates the ring and the full history
    /// plus transient tail goes out instead.
    async fn on_subscribe(&self, session: &Arc<Session>, browser_id: &str, last_seq: u64) {
        let mut inner = session.inner.lock().await;
        let next = inner.sequencer.next_seq();
        if last_seq.saturating_add(1) >= next {
            return;
        }

        let earliest = inner.sequencer.earliest_buffered().unwrap_or(next);
        if last_seq > 0 && last_seq.saturating_add(1) < earliest {
            let history = BrowserFrame::MessageHistory {
                messages: inner.history.to_frames(),
            };
            inner.send_direct(browser_id, &history);

            let events = replay_events(&inner.sequencer.events_after(last_seq, true));
            if !events.is_empty() {
                inner.send_direct(browser_id, &BrowserFrame::EventReplay { events });
            }
        } else {
            let events = replay_events(&inner.sequencer.events_after(last_seq, false));
            if !events.is_empty() {
                inner.send_direct(browser_id, &BrowserFrame::EventReplay { events });
            }
        }
    }

    /// Advance the per-socket and per-session high-water marks; positions
    /// never move backwards.
    async fn on_ack(&self, session: &Arc<Session>, browser_id: &str, last_seq: u64) {
        let advanced = {
            let mut inner = session.inner.lock().await;
            let capped = last_seq.min(inner.sequencer.next_seq().saturating_sub(1));
            if let Some(conn) = inner.browsers.get_mut(browser_id) {
                conn.last_ack_seq = conn.last_ack_seq.max(capped);
            }
            if capped > inner.last_ack_seq {
                inner.last_ack_seq = capped;
                true
            } else {
                false
            }
        };
        if advanced {
            self.persist_session(session).await;
        }
    }

    // =========================================================================
    // Dispatch targets
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn on_permission_response(
        self: &Arc<Self>,
        session: &Arc<Session>,
        adapter_session: bool,
        raw: Value,
        request_id: String,
        behavior: String,
        updated_input: Option<Value>,
        updated_permissions: Option<Vec<Value>>,
        message: Option<String>,
    ) {
        let removed = {
            let mut inner = session.inner.lock().await;
            inner.pending_perms.remove(&request_id)
        };
        if removed.is_none() {
            // Upstream may have forgotten the request already; forward anyway
            tracing::debug!(
                session_id = %session.id,
                request_id = %request_id,
                "Permission response for unknown request"
            );
        }

        let allow = behavior == "allow";
        if adapter_session {
            self.forward_to_adapter(session, raw).await;
        } else {
            let wire = if allow {
                let input = updated_input
                    .or_else(|| removed.as_ref().map(|r| r.input.clone()))
                    .unwrap_or(Value::Null);
                allow_response_wire(&request_id, &input, &updated_permissions)
            } else {
                deny_response_wire(&request_id, message.as_deref().unwrap_or("Denied by user"))
            };
            session.inner.lock().await.send_to_cli_or_queue(&wire);
        }

        self.emit_permission_responded(
            session,
            &request_id,
            if allow { "allow" } else { "deny" },
            false,
            false,
            None,
        )
        .await;
        self.persist_session(session).await;
    }

    /// Emit a control request toward the session's upstream: a fresh-id
    /// control frame on primary sessions, the original form on adapters.
    async fn send_control(
        self: &Arc<Self>,
        session: &Arc<Session>,
        adapter_session: bool,
        raw: Value,
        request: Value,
    ) {
        if adapter_session {
            self.forward_to_adapter(session, raw).await;
        } else {
            let (_, wire) = control_request_wire(request);
            session.inner.lock().await.send_to_cli_or_queue(&wire);
            self.persist_session(session).await;
        }
    }

    async fn forward_to_adapter(&self, session: &Arc<Session>, raw: Value) {
        let adapter = { session.inner.lock().await.adapter.clone() };
        match adapter {
            Some(adapter) => {
                if let Err(e) = adapter.forward(raw.clone()).await {
                    tracing::warn!(session_id = %session.id, "Adapter forward failed: {}", e);
                    session
                        .inner
                        .lock()
                        .await
                        .outbound
                        .push(format!("{}\n", raw));
                }
            }
            None => {
                session
                    .inner
                    .lock()
                    .await
                    .outbound
                    .push(format!("{}\n", raw));
            }
        }
    }

    // =========================================================================
    // MCP status
    // =========================================================================

    /// Ask upstream for MCP server status; the continuation broadcasts the
    /// answer to browsers when the control response lands.
    pub(crate) async fn request_mcp_status(self: &Arc<Self>, session: &Arc<Session>) {
        let hub = Arc::downgrade(self);
        let session_id = session.id.clone();
        let (request_id, wire) = control_request_wire(serde_json::json!({
            "subtype": "mcp_status",
        }));

        let mut inner = session.inner.lock().await;
        inner
            .pending_ctrl
            .insert(request_id, "mcp_status", move |payload| {
                if let Some(hub) = hub.upgrade() {
                    tokio::spawn(async move {
                        hub.mcp_status_resolved(&session_id, payload).await;
                    });
                }
            });
        inner.send_to_cli_or_queue(&wire);
    }

    async fn mcp_status_resolved(self: &Arc<Self>, session_id: &str, payload: Value) {
        let session = match self.get(session_id).await {
            Some(s) => s,
            None => return,
        };

        let servers: Vec<McpServer> = payload
            .get("mcp_servers")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        {
            let mut inner = session.inner.lock().await;
            inner.state.mcp_servers = servers.clone();
            inner.broadcast(&BrowserFrame::McpStatus {
                servers: servers.clone(),
            });
        }

        self.invoke_plugins(
            &session,
            events::MCP_STATUS_CHANGED,
            None,
            serde_json::json!({ "servers": servers }),
        )
        .await;
        self.persist_session(&session).await;
    }

    fn schedule_mcp_refresh(self: &Arc<Self>, session_id: &str, delay: Duration) {
        let hub = Arc::downgrade(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(hub) = hub.upgrade() else { return };
            if let Some(session) = hub.get(&session_id).await {
                hub.request_mcp_status(&session).await;
            }
        });
    }

    // =========================================================================
    // User message pipeline (serializer worker entry point)
    // =========================================================================

    /// Process one user message in arrival order: plugin middleware first,
    /// then history append, browser echo, and upstream delivery.
    pub(crate) async fn process_user_message(
        self: &Arc<Self>,
        session_id: &str,
        queued: QueuedUserMessage,
    ) {
        let session = match self.get(session_id).await {
            Some(s) => s,
            None => return,
        };

        let mut content = queued.content;
        let mut images = queued.images;
        let mut raw = queued.raw;

        let outcome = self
            .invoke_plugins(
                &session,
                events::USER_MESSAGE_BEFORE_SEND,
                None,
                serde_json::json!({
                    "content": content,
                    "image_count": images.as_ref().map(|i| i.len()).unwrap_or(0),
                }),
            )
            .await;

        if let Some(outcome) = outcome {
            let blocked = outcome.aborted
                || outcome
                    .user_message_mutation
                    .as_ref()
                    .map(|m| m.blocked)
                    .unwrap_or(false);
            if blocked {
                self.publish_insight(
                    &session,
                    PluginInsight::warning("User message blocked by plugin"),
                )
                .await;
                return;
            }
            if let Some(mutation) = outcome.user_message_mutation {
                if let Some(new_content) = mutation.content {
                    content = new_content;
                    raw["content"] = Value::String(content.clone());
                }
                if let Some(new_images) = mutation.images {
                    raw["images"] = serde_json::to_value(&new_images).unwrap_or_default();
                    images = Some(new_images);
                }
            }
        }

        let timestamp = now_millis();
        let message_id = uuid::Uuid::new_v4().to_string();
        let upstream = {
            let mut inner = session.inner.lock().await;
            inner.history.push(HistoryEntry::User {
                id: message_id.clone(),
                content: content.clone(),
                images: images.clone(),
                timestamp,
            });
            inner.broadcast(&BrowserFrame::UserMessage {
                id: message_id.clone(),
                content: content.clone(),
                timestamp,
            });

            if inner.state.backend_kind == BackendKind::SubprocessAdapter {
                match &inner.adapter {
                    Some(adapter) => Upstream::Adapter(adapter.clone()),
                    None => {
                        inner.outbound.push(format!("{}\n", raw));
                        Upstream::Detached
                    }
                }
            } else {
                let wire = user_wire(&content, &images, &inner.cli_session_id);
                inner.send_to_cli_or_queue(&wire);
                Upstream::Cli
            }
        };

        if let Upstream::Adapter(adapter) = upstream {
            if let Err(e) = adapter.forward(raw.clone()).await {
                tracing::warn!(session_id, "Adapter forward failed: {}", e);
                session
                    .inner
                    .lock()
                    .await
                    .outbound
                    .push(format!("{}\n", raw));
            }
        }

        self.invoke_plugins(
            &session,
            events::USER_MESSAGE_SENT,
            Some(message_id),
            serde_json::json!({ "content": content }),
        )
        .await;
        self.persist_session(&session).await;
    }
}

fn replay_events(buffered: &[crate::bridge::types::BufferedEvent]) -> Vec<Value> {
    buffered
        .iter()
        .map(|e| serde_json::json!({ "seq": e.seq, "message": e.frame }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::adapter::testing::RecordingAdapter;
    use crate::bridge::hub::BridgeHooks;
    use crate::bridge::types::{PermissionRequest, UpstreamMessage};
    use crate::config::LimitsConfig;
    use crate::store::SessionStore;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn make_hub() -> (Arc<Hub>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().to_path_buf()).unwrap();
        let hub = Hub::new(
            store,
            LimitsConfig::default(),
            BridgeHooks::default(),
            None,
        );
        (hub, dir)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }

    fn command(json: &str) -> BrowserCommand {
        serde_json::from_str(json).unwrap()
    }

    fn stream_event(n: u64) -> UpstreamMessage {
        crate::bridge::types::parse_ndjson(&format!(
            r#"{{"type":"stream_event","event":{{"n":{}}},"parent_tool_use_id":null}}"#,
            n
        ))
        .remove(0)
    }

    async fn wait_until<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_replay_no_gap_sends_nothing() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, _cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        // First browser sees the live stream
        let (b1_tx, mut b1_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b1_tx).await;
        hub.handle_cli_message("s1", stream_event(1)).await;
        hub.handle_cli_message("s1", stream_event(2)).await;
        let b1_frames = frames(&mut b1_rx);
        let last_seq = b1_frames
            .iter()
            .filter(|f| f["type"] == "stream_event")
            .filter_map(|f| f["seq"].as_u64())
            .max()
            .unwrap();
        hub.handle_browser_close("s1", "b1").await;

        // Reconnect with everything acknowledged: nothing to replay
        let (b2_tx, mut b2_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b2", b2_tx).await;
        let _ = frames(&mut b2_rx);
        hub.route_browser_message(
            "s1",
            "b2",
            BrowserCommand::SessionSubscribe { last_seq },
        )
        .await;

        let seen = frames(&mut b2_rx);
        assert!(!seen.iter().any(|f| f["type"] == "event_replay"));
    }

    #[tokio::test]
    async fn test_replay_buffer_covered_gap() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, _cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        let (b1_tx, mut b1_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b1_tx).await;
        hub.handle_cli_message("s1", stream_event(1)).await;
        hub.handle_cli_message("s1", stream_event(2)).await;
        let b1_frames = frames(&mut b1_rx);
        let stream_seqs: Vec<u64> = b1_frames
            .iter()
            .filter(|f| f["type"] == "stream_event")
            .filter_map(|f| f["seq"].as_u64())
            .collect();
        assert_eq!(stream_seqs.len(), 2);
        hub.handle_browser_close("s1", "b1").await;

        // Reconnect missing both stream events
        let (b2_tx, mut b2_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b2", b2_tx).await;
        let _ = frames(&mut b2_rx);
        hub.route_browser_message(
            "s1",
            "b2",
            BrowserCommand::SessionSubscribe {
                last_seq: stream_seqs[0] - 1,
            },
        )
        .await;

        let seen = frames(&mut b2_rx);
        let replay = seen.iter().find(|f| f["type"] == "event_replay").unwrap();
        let events = replay["events"].as_array().unwrap();
        let replayed: Vec<u64> = events
            .iter()
            .filter_map(|e| e["seq"].as_u64())
            .collect();
        assert!(replayed.contains(&stream_seqs[0]));
        assert!(replayed.contains(&stream_seqs[1]));
        // Buffer covered the gap: no history fallback
        assert!(!seen.iter().any(|f| f["type"] == "message_history"));
    }

    #[tokio::test]
    async fn test_replay_oversized_gap_falls_back_to_history() {
        let (hub, _dir) = make_hub().await;
        let session = hub.ensure_session("s1", None).await;
        let (cli_tx, _cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        // A durable user message plus a run of transient events
        {
            let mut inner = session.inner.lock().await;
            inner.history.push(HistoryEntry::User {
                id: "u1".to_string(),
                content: "hello".to_string(),
                images: None,
                timestamp: 0,
            });
            inner.broadcast(&BrowserFrame::UserMessage {
                id: "u1".to_string(),
                content: "hello".to_string(),
                timestamp: 0,
            });
        }
        for n in 0..8 {
            hub.handle_cli_message("s1", stream_event(n)).await;
        }

        // Force the ring to forget its oldest entries
        let dropped_through = {
            let mut inner = session.inner.lock().await;
            let earliest = inner.sequencer.earliest_buffered().unwrap();
            inner.sequencer.drop_through(earliest + 2);
            earliest + 2
        };

        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b_tx).await;
        let open_frames = frames(&mut b_rx);
        assert_eq!(open_frames[0]["type"], "session_init");

        hub.route_browser_message(
            "s1",
            "b1",
            BrowserCommand::SessionSubscribe { last_seq: 1 },
        )
        .await;

        let seen = frames(&mut b_rx);
        // History snapshot first, then only transient events from the ring
        assert_eq!(seen[0]["type"], "message_history");
        assert_eq!(seen[0]["messages"][0]["content"], "hello");
        let replay = seen.iter().find(|f| f["type"] == "event_replay").unwrap();
        for event in replay["events"].as_array().unwrap() {
            assert_eq!(event["message"]["type"], "stream_event");
            assert!(event["seq"].as_u64().unwrap() > dropped_through);
        }
    }

    #[tokio::test]
    async fn test_idempotent_retry_sends_upstream_once() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b_tx).await;

        let msg = r#"{"type":"user_message","content":"hi","client_msg_id":"c1"}"#;
        hub.route_browser_message("s1", "b1", command(msg)).await;
        hub.route_browser_message("s1", "b1", command(msg)).await;

        let hub2 = hub.clone();
        wait_until(|| {
            let hub = hub2.clone();
            async move {
                let session = hub.get("s1").await.unwrap();
                let len = session.inner.lock().await.history.len();
                len >= 1
            }
        })
        .await;

        let session = hub.get("s1").await.unwrap();
        assert_eq!(session.inner.lock().await.history.len(), 1);

        let mut user_frames = 0;
        while let Ok(line) = cli_rx.try_recv() {
            let wire: Value = serde_json::from_str(line.trim()).unwrap();
            if wire["type"] == "user" {
                assert_eq!(wire["message"]["content"], "hi");
                user_frames += 1;
            }
        }
        assert_eq!(user_frames, 1);
    }

    #[tokio::test]
    async fn test_upstream_death_mid_permission_then_reconnect() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, _cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b_tx).await;
        let _ = frames(&mut b_rx);

        let can_use = crate::bridge::types::parse_ndjson(
            r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{}}}"#,
        )
        .remove(0);
        hub.handle_cli_message("s1", can_use).await;

        let session = hub.get("s1").await.unwrap();
        assert!(session.inner.lock().await.pending_perms.contains("r1"));

        hub.handle_cli_close("s1").await;
        let seen = frames(&mut b_rx);
        assert!(seen
            .iter()
            .any(|f| f["type"] == "permission_cancelled" && f["request_id"] == "r1"));
        assert!(seen.iter().any(|f| f["type"] == "cli_disconnected"));
        assert!(session.inner.lock().await.pending_perms.is_empty());

        // Reconnecting browser must not see a stale permission prompt
        let (b2_tx, mut b2_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b2", b2_tx).await;
        let seen = frames(&mut b2_rx);
        assert_eq!(seen[0]["type"], "session_init");
        assert!(seen.iter().any(|f| f["type"] == "cli_disconnected"));
        assert!(!seen.iter().any(|f| f["type"] == "permission_request"));
    }

    #[tokio::test]
    async fn test_permission_response_allow_defaults_to_original_input() {
        let (hub, _dir) = make_hub().await;
        let session = hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;
        session.inner.lock().await.pending_perms.insert(PermissionRequest {
            request_id: "r1".to_string(),
            tool_name: "Bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
            permission_suggestions: None,
            description: None,
            tool_use_id: None,
            agent_id: None,
            timestamp: 0,
        });

        hub.route_browser_message(
            "s1",
            "b1",
            command(r#"{"type":"permission_response","request_id":"r1","behavior":"allow"}"#),
        )
        .await;

        let line = cli_rx.try_recv().unwrap();
        let wire: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(wire["response"]["response"]["behavior"], "allow");
        assert_eq!(wire["response"]["response"]["updatedInput"]["command"], "ls");
        assert!(session.inner.lock().await.pending_perms.is_empty());
    }

    #[tokio::test]
    async fn test_permission_response_deny_default_message() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        // Unknown request id: nothing pending, response still forwarded
        hub.route_browser_message(
            "s1",
            "b1",
            command(r#"{"type":"permission_response","request_id":"ghost","behavior":"deny"}"#),
        )
        .await;

        let line = cli_rx.try_recv().unwrap();
        let wire: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(wire["response"]["response"]["behavior"], "deny");
        assert_eq!(wire["response"]["response"]["message"], "Denied by user");
    }

    #[tokio::test]
    async fn test_interrupt_and_mode_controls_reach_upstream() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        hub.route_browser_message("s1", "b1", command(r#"{"type":"interrupt"}"#))
            .await;
        hub.route_browser_message(
            "s1",
            "b1",
            command(r#"{"type":"set_model","model":"claude-opus-4-20250514"}"#),
        )
        .await;
        hub.route_browser_message(
            "s1",
            "b1",
            command(r#"{"type":"set_permission_mode","mode":"plan"}"#),
        )
        .await;

        let mut subtypes = Vec::new();
        let mut request_ids = Vec::new();
        while let Ok(line) = cli_rx.try_recv() {
            let wire: Value = serde_json::from_str(line.trim()).unwrap();
            assert_eq!(wire["type"], "control_request");
            subtypes.push(wire["request"]["subtype"].as_str().unwrap().to_string());
            request_ids.push(wire["request_id"].as_str().unwrap().to_string());
        }
        assert_eq!(subtypes, vec!["interrupt", "set_model", "set_permission_mode"]);
        // Fresh ids, and none of them parked a continuation
        assert_ne!(request_ids[0], request_ids[1]);
        let session = hub.get("s1").await.unwrap();
        assert!(session.inner.lock().await.pending_ctrl.is_empty());
    }

    #[tokio::test]
    async fn test_mcp_status_roundtrip_broadcasts_servers() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b_tx).await;
        let _ = frames(&mut b_rx);

        hub.route_browser_message("s1", "b1", command(r#"{"type":"mcp_get_status"}"#))
            .await;

        let line = cli_rx.try_recv().unwrap();
        let wire: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(wire["request"]["subtype"], "mcp_status");
        let request_id = wire["request_id"].as_str().unwrap().to_string();

        let response = crate::bridge::types::parse_ndjson(&format!(
            r#"{{"type":"control_response","response":{{"subtype":"success","request_id":"{}","response":{{"mcp_servers":[{{"name":"fs","status":"connected"}}]}}}}}}"#,
            request_id
        ))
        .remove(0);
        hub.handle_cli_message("s1", response).await;

        let hub2 = hub.clone();
        wait_until(|| {
            let hub = hub2.clone();
            async move {
                hub.snapshot("s1")
                    .await
                    .map(|s| !s.mcp_servers.is_empty())
                    .unwrap_or(false)
            }
        })
        .await;

        let seen = frames(&mut b_rx);
        let status = seen.iter().find(|f| f["type"] == "mcp_status").unwrap();
        assert_eq!(status["servers"][0]["name"], "fs");
    }

    #[tokio::test]
    async fn test_ack_advances_and_never_decreases() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, _cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b_tx).await;
        for n in 0..5 {
            hub.handle_cli_message("s1", stream_event(n)).await;
        }

        let session = hub.get("s1").await.unwrap();
        hub.route_browser_message("s1", "b1", BrowserCommand::SessionAck { last_seq: 4 })
            .await;
        assert_eq!(session.inner.lock().await.last_ack_seq, 4);

        hub.route_browser_message("s1", "b1", BrowserCommand::SessionAck { last_seq: 2 })
            .await;
        assert_eq!(session.inner.lock().await.last_ack_seq, 4);

        // Acks are capped at what was actually assigned
        hub.route_browser_message("s1", "b1", BrowserCommand::SessionAck { last_seq: 999 })
            .await;
        let inner = session.inner.lock().await;
        assert!(inner.last_ack_seq < inner.sequencer.next_seq());
    }

    #[tokio::test]
    async fn test_adapter_session_forwards_controls() {
        let (hub, _dir) = make_hub().await;
        let adapter = RecordingAdapter::ready();
        hub.attach_adapter("s1", adapter.clone()).await;
        let session = hub.ensure_session("s1", None).await;
        session.inner.lock().await.pending_perms.insert(PermissionRequest {
            request_id: "r1".to_string(),
            tool_name: "Bash".to_string(),
            input: serde_json::json!({}),
            permission_suggestions: None,
            description: None,
            tool_use_id: None,
            agent_id: None,
            timestamp: 0,
        });

        hub.route_browser_message("s1", "b1", command(r#"{"type":"interrupt"}"#))
            .await;
        hub.route_browser_message(
            "s1",
            "b1",
            command(r#"{"type":"permission_response","request_id":"r1","behavior":"allow"}"#),
        )
        .await;

        let forwarded = adapter.forwarded.lock().await;
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0]["type"], "interrupt");
        assert_eq!(forwarded[1]["type"], "permission_response");
        drop(forwarded);
        // Permission cleared locally as well
        assert!(session.inner.lock().await.pending_perms.is_empty());
    }

    #[tokio::test]
    async fn test_adapter_session_user_message_forwards_original_form() {
        let (hub, _dir) = make_hub().await;
        let adapter = RecordingAdapter::ready();
        hub.attach_adapter("s1", adapter.clone()).await;

        hub.route_browser_message(
            "s1",
            "b1",
            command(r#"{"type":"user_message","content":"hi","client_msg_id":"c9"}"#),
        )
        .await;

        let adapter2 = adapter.clone();
        wait_until(|| {
            let adapter = adapter2.clone();
            async move { !adapter.forwarded.lock().await.is_empty() }
        })
        .await;

        let forwarded = adapter.forwarded.lock().await;
        assert_eq!(forwarded[0]["type"], "user_message");
        assert_eq!(forwarded[0]["content"], "hi");
        assert_eq!(forwarded[0]["client_msg_id"], "c9");

        // Appended to history like any other user message
        let session = hub.get("s1").await.unwrap();
        assert_eq!(session.inner.lock().await.history.len(), 1);
    }

    #[tokio::test]
    async fn test_user_messages_process_in_order() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        for n in 0..5 {
            hub.route_browser_message(
                "s1",
                "b1",
                command(&format!(
                    r#"{{"type":"user_message","content":"msg {}"}}"#,
                    n
                )),
            )
            .await;
        }

        let hub2 = hub.clone();
        wait_until(|| {
            let hub = hub2.clone();
            async move {
                let session = hub.get("s1").await.unwrap();
                let len = session.inner.lock().await.history.len();
                len == 5
            }
        })
        .await;

        let mut contents = Vec::new();
        while let Ok(line) = cli_rx.try_recv() {
            let wire: Value = serde_json::from_str(line.trim()).unwrap();
            if wire["type"] == "user" {
                contents.push(wire["message"]["content"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn test_user_message_queued_while_detached() {
        let (hub, _dir) = make_hub().await;
        hub.ensure_session("s1", None).await;
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", b_tx).await;

        hub.route_browser_message(
            "s1",
            "b1",
            command(r#"{"type":"user_message","content":"queued"}"#),
        )
        .await;

        let hub2 = hub.clone();
        wait_until(|| {
            let hub = hub2.clone();
            async move {
                let session = hub.get("s1").await.unwrap();
                let pending = session.inner.lock().await.outbound.len();
                pending == 1
            }
        })
        .await;

        // Upstream attaches and receives the queued frame
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;
        let line = cli_rx.try_recv().unwrap();
        assert!(line.contains("queued"));
    }
}
