//! Upstream (CLI) message routing
//!
//! Each parsed NDJSON message from the upstream socket (or a translated
//! message from a subprocess adapter) is dispatched here. Handlers update the
//! session under its lock, broadcast tagged frames to browsers, and run the
//! plugin and hook suspension points after the lock is released.

use crate::bridge::hub::Hub;
use crate::bridge::plugin::events;
use crate::bridge::session::Session;
use crate::bridge::types::{
    allow_response_wire, compute_context_percent, deny_response_wire, now_millis,
    AssistantEnvelope, AuthStatusMessage, BrowserFrame, ControlRequestMessage,
    ControlResponseMessage, HistoryEntry, PermissionRequest, ResultMessage, StreamEventMessage,
    SystemMessage, ToolProgressMessage, ToolUseSummaryMessage, UpstreamMessage,
};
use serde_json::Value;
use std::sync::Arc;

impl Hub {
    /// Route one upstream message to its handler.
    pub async fn handle_cli_message(self: &Arc<Self>, session_id: &str, message: UpstreamMessage) {
        let session = match self.get(session_id).await {
            Some(s) => s,
            None => {
                tracing::warn!(session_id, "Upstream message for unknown session");
                return;
            }
        };

        match message {
            UpstreamMessage::System(sys) => match sys.subtype.as_str() {
                "init" => self.on_system_init(&session, sys).await,
                "status" => self.on_system_status(&session, sys).await,
                other => tracing::debug!(session_id, "Unknown system subtype: {}", other),
            },
            UpstreamMessage::Assistant(env) => self.on_assistant(&session, env).await,
            UpstreamMessage::Result(res) => self.on_result(&session, res).await,
            UpstreamMessage::StreamEvent(se) => self.on_stream_event(&session, se).await,
            UpstreamMessage::ControlRequest(cr) => self.on_control_request(&session, cr).await,
            UpstreamMessage::ControlResponse(cr) => self.on_control_response(&session, cr).await,
            UpstreamMessage::ToolProgress(tp) => self.on_tool_progress(&session, tp).await,
            UpstreamMessage::ToolUseSummary(tus) => self.on_tool_use_summary(&session, tus).await,
            UpstreamMessage::AuthStatus(auth) => self.on_auth_status(&session, auth).await,
            UpstreamMessage::KeepAlive => {}
            UpstreamMessage::Unknown => {
                tracing::debug!(session_id, "Ignoring unknown upstream message type");
            }
        }
    }

    async fn on_system_init(self: &Arc<Self>, session: &Arc<Session>, sys: SystemMessage) {
        let (cwd, learned) = {
            let mut inner = session.inner.lock().await;
            let state = &mut inner.state;
            if let Some(cwd) = sys.cwd {
                state.cwd = cwd;
            }
            if let Some(model) = sys.model {
                state.model = model;
            }
            if let Some(tools) = sys.tools {
                state.tools = tools;
            }
            if let Some(mode) = sys.permission_mode {
                state.permission_mode = mode;
            }
            if let Some(version) = sys.version {
                state.version = version;
            }
            if let Some(servers) = sys.mcp_servers {
                state.mcp_servers = servers;
            }
            if let Some(agents) = sys.agents {
                state.agents = agents;
            }
            if let Some(commands) = sys.slash_commands {
                state.slash_commands = commands;
            }
            if let Some(skills) = sys.skills {
                state.skills = skills;
            }

            if let Some(ref cli_sid) = sys.session_id {
                inner.cli_session_id = Some(cli_sid.clone());
            }
            (inner.state.cwd.clone(), sys.session_id)
        };

        // Repository metadata before the snapshot goes out
        let meta = if cwd.is_empty() {
            None
        } else {
            Some(crate::repo::resolve(&cwd).await)
        };

        let git_ready = {
            let mut inner = session.inner.lock().await;
            let git_ready = match &meta {
                Some(m) => inner.apply_repo_meta(m).1,
                None => false,
            };
            let snapshot = inner.state.clone();
            inner.broadcast(&BrowserFrame::SessionInit { session: snapshot });
            git_ready
        };

        if let Some(cli_sid) = learned {
            self.hook_cli_session_id(&session.id, &cli_sid);
        }
        if git_ready {
            if let Some(m) = &meta {
                self.hook_git_ready(&session.id, &cwd, &m.branch);
            }
        }
        self.persist_session(session).await;
    }

    async fn on_system_status(self: &Arc<Self>, session: &Arc<Session>, sys: SystemMessage) {
        let status = {
            let mut inner = session.inner.lock().await;
            inner.state.is_compacting = sys.status.as_deref() == Some("compacting");
            if let Some(mode) = sys.permission_mode {
                inner.state.permission_mode = mode;
            }
            inner.broadcast(&BrowserFrame::StatusChange {
                status: sys.status.clone(),
            });
            sys.status
        };

        self.invoke_plugins(
            session,
            events::SESSION_STATUS_CHANGED,
            None,
            serde_json::json!({ "status": status }),
        )
        .await;
        self.persist_session(session).await;
    }

    async fn on_assistant(self: &Arc<Self>, session: &Arc<Session>, env: AssistantEnvelope) {
        let (text, tool_names) = (env.message.text(), env.message.tool_names());
        {
            let mut inner = session.inner.lock().await;
            inner.history.push(HistoryEntry::Assistant {
                message: env.message.clone(),
                parent_tool_use_id: env.parent_tool_use_id.clone(),
            });
            inner.broadcast(&BrowserFrame::Assistant {
                message: env.message,
                parent_tool_use_id: env.parent_tool_use_id,
            });
        }

        self.invoke_plugins(
            session,
            events::MESSAGE_ASSISTANT,
            None,
            serde_json::json!({ "text": text, "tool_names": tool_names }),
        )
        .await;
        self.persist_session(session).await;
    }

    async fn on_result(self: &Arc<Self>, session: &Arc<Session>, res: ResultMessage) {
        {
            let mut inner = session.inner.lock().await;
            let state = &mut inner.state;
            if let Some(cost) = res.total_cost_usd {
                state.total_cost_usd = cost;
            }
            if let Some(turns) = res.num_turns {
                state.num_turns = turns;
            }
            if let Some(added) = res.total_lines_added {
                state.total_lines_added = added;
            }
            if let Some(removed) = res.total_lines_removed {
                state.total_lines_removed = removed;
            }
            if let Some(ref usage) = res.model_usage {
                state.context_used_percent = compute_context_percent(usage);
            }
        }

        self.refresh_repo(session).await;

        let data = serde_json::to_value(&res).unwrap_or_default();
        let error_summary = if res.is_error {
            Some(match &res.errors {
                Some(errors) if !errors.is_empty() => errors.join("; "),
                _ => res
                    .result
                    .clone()
                    .unwrap_or_else(|| "Turn failed".to_string()),
            })
        } else {
            None
        };

        let first_turn_text = {
            let mut inner = session.inner.lock().await;
            inner.history.push(HistoryEntry::Result { data: data.clone() });
            inner.broadcast(&BrowserFrame::Result { data: data.clone() });

            if let Some(message) = error_summary {
                inner.history.push(HistoryEntry::SystemError {
                    message: message.clone(),
                });
                inner.broadcast(&BrowserFrame::Error { message });
            }

            if !res.is_error && !inner.auto_naming_done {
                match inner.history.first_user_text() {
                    Some(text) => {
                        inner.auto_naming_done = true;
                        Some(text)
                    }
                    None => None,
                }
            } else {
                None
            }
        };

        self.invoke_plugins(
            session,
            events::RESULT_RECEIVED,
            None,
            serde_json::json!({
                "is_error": res.is_error,
                "num_turns": res.num_turns,
                "total_cost_usd": res.total_cost_usd,
            }),
        )
        .await;

        if let Some(text) = first_turn_text {
            self.hook_first_turn(&session.id, &text);
        }
        self.persist_session(session).await;
    }

    async fn on_stream_event(self: &Arc<Self>, session: &Arc<Session>, se: StreamEventMessage) {
        // Broadcast verbatim; stream deltas are never stored in history
        {
            let mut inner = session.inner.lock().await;
            inner.broadcast(&BrowserFrame::StreamEvent {
                event: se.event,
                parent_tool_use_id: se.parent_tool_use_id,
            });
        }
        self.persist_session(session).await;
    }

    async fn on_control_request(
        self: &Arc<Self>,
        session: &Arc<Session>,
        cr: ControlRequestMessage,
    ) {
        if cr.request.subtype != "can_use_tool" {
            tracing::debug!(
                session_id = %session.id,
                subtype = %cr.request.subtype,
                "Ignoring control request subtype"
            );
            return;
        }

        let request = PermissionRequest {
            request_id: cr.request_id,
            tool_name: cr.request.tool_name.unwrap_or_default(),
            input: cr.request.input.unwrap_or(Value::Null),
            permission_suggestions: cr.request.permission_suggestions,
            description: cr.request.description,
            tool_use_id: cr.request.tool_use_id,
            agent_id: cr.request.agent_id,
            timestamp: now_millis(),
        };

        if self.plugins.is_some() {
            let data = serde_json::to_value(&request).unwrap_or_default();
            let outcome = self
                .invoke_plugins(
                    session,
                    events::PERMISSION_REQUESTED,
                    Some(request.request_id.clone()),
                    data,
                )
                .await;

            if let Some(outcome) = outcome {
                if outcome.aborted {
                    let wire = deny_response_wire(&request.request_id, "Aborted by plugin");
                    session.inner.lock().await.send_to_cli_or_queue(&wire);
                    self.emit_permission_responded(
                        session,
                        &request.request_id,
                        "deny",
                        true,
                        true,
                        None,
                    )
                    .await;
                    self.persist_session(session).await;
                    return;
                }

                if let Some(decision) = outcome.permission_decision {
                    let allow = decision.behavior == "allow";
                    let wire = if allow {
                        let input = decision
                            .updated_input
                            .clone()
                            .unwrap_or_else(|| request.input.clone());
                        allow_response_wire(&request.request_id, &input, &None)
                    } else {
                        // Anything other than allow is treated as deny
                        let message = decision.message.clone().unwrap_or_else(|| {
                            if decision.behavior == "deny" {
                                "Denied by plugin".to_string()
                            } else {
                                format!(
                                    "Denied by plugin (unrecognized behavior '{}')",
                                    decision.behavior
                                )
                            }
                        });
                        deny_response_wire(&request.request_id, &message)
                    };
                    session.inner.lock().await.send_to_cli_or_queue(&wire);
                    self.emit_permission_responded(
                        session,
                        &request.request_id,
                        if allow { "allow" } else { "deny" },
                        true,
                        false,
                        decision.plugin_id,
                    )
                    .await;
                    self.persist_session(session).await;
                    return;
                }
            }
            // Plugin fault or no decision: fall through to the human prompt
        }

        {
            let mut inner = session.inner.lock().await;
            inner.pending_perms.insert(request.clone());
            inner.broadcast(&BrowserFrame::PermissionRequest { request });
        }
        self.persist_session(session).await;
    }

    async fn on_control_response(
        self: &Arc<Self>,
        session: &Arc<Session>,
        cr: ControlResponseMessage,
    ) {
        let body = cr.response;
        let entry = session
            .inner
            .lock()
            .await
            .pending_ctrl
            .complete(&body.request_id);

        match entry {
            Some(ctrl) => {
                if body.subtype == "error" {
                    tracing::warn!(
                        session_id = %session.id,
                        request_id = %body.request_id,
                        subtype = %ctrl.subtype,
                        error = ?body.error,
                        "Control request failed upstream"
                    );
                } else {
                    // Continuations run outside the session lock
                    (ctrl.resolve)(body.response.unwrap_or(Value::Null));
                }
            }
            None => {
                tracing::debug!(
                    session_id = %session.id,
                    request_id = %body.request_id,
                    "Discarding unmatched control response"
                );
            }
        }
    }

    async fn on_tool_progress(self: &Arc<Self>, session: &Arc<Session>, tp: ToolProgressMessage) {
        let first_seen = {
            let mut inner = session.inner.lock().await;
            let first_seen = inner.started_tools.insert(tp.tool_use_id.clone());
            inner.broadcast(&BrowserFrame::ToolProgress {
                tool_use_id: tp.tool_use_id.clone(),
                tool_name: tp.tool_name.clone(),
                elapsed_time_seconds: tp.elapsed_time_seconds,
            });
            first_seen
        };

        if first_seen {
            self.invoke_plugins(
                session,
                events::TOOL_STARTED,
                Some(tp.tool_use_id.clone()),
                serde_json::json!({ "tool_use_id": tp.tool_use_id, "tool_name": tp.tool_name }),
            )
            .await;
        }
        self.persist_session(session).await;
    }

    async fn on_tool_use_summary(
        self: &Arc<Self>,
        session: &Arc<Session>,
        tus: ToolUseSummaryMessage,
    ) {
        let finished: Vec<String> = {
            let mut inner = session.inner.lock().await;
            let finished = tus
                .preceding_tool_use_ids
                .iter()
                .filter(|id| inner.started_tools.remove(*id))
                .cloned()
                .collect();
            inner.broadcast(&BrowserFrame::ToolUseSummary {
                summary: tus.summary.clone(),
                tool_use_ids: tus.preceding_tool_use_ids.clone(),
            });
            finished
        };

        for tool_use_id in finished {
            self.invoke_plugins(
                session,
                events::TOOL_FINISHED,
                Some(tool_use_id.clone()),
                serde_json::json!({ "tool_use_id": tool_use_id }),
            )
            .await;
        }
        self.persist_session(session).await;
    }

    async fn on_auth_status(self: &Arc<Self>, session: &Arc<Session>, auth: AuthStatusMessage) {
        {
            let mut inner = session.inner.lock().await;
            inner.broadcast(&BrowserFrame::AuthStatus {
                is_authenticating: auth.is_authenticating,
                output: auth.output,
                error: auth.error,
            });
        }
        self.persist_session(session).await;
    }

    /// Emit the `permission.responded` event and, for automated responses,
    /// surface an insight so browsers can see what the plugin decided.
    pub(crate) async fn emit_permission_responded(
        &self,
        session: &Arc<Session>,
        request_id: &str,
        behavior: &str,
        automated: bool,
        aborted: bool,
        plugin_id: Option<String>,
    ) {
        let mut data = serde_json::json!({
            "request_id": request_id,
            "behavior": behavior,
            "automated": automated,
        });
        if aborted {
            data["aborted"] = Value::Bool(true);
        }
        if let Some(ref pid) = plugin_id {
            data["plugin_id"] = Value::String(pid.clone());
        }

        self.invoke_plugins(
            session,
            events::PERMISSION_RESPONDED,
            Some(request_id.to_string()),
            data,
        )
        .await;

        if automated {
            let mut insight = crate::bridge::plugin::PluginInsight {
                level: "info".to_string(),
                message: format!("Permission {} resolved automatically: {}", request_id, behavior),
                plugin_id,
            };
            if aborted {
                insight.message = format!("Permission {} aborted by plugin", request_id);
            }
            self.publish_insight(session, insight).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::hub::BridgeHooks;
    use crate::bridge::plugin::{PermissionDecision, PluginEvent, PluginManager, PluginOutcome};
    use crate::config::LimitsConfig;
    use crate::store::SessionStore;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Mutex};

    /// Scripted plugin manager for routing tests.
    #[derive(Default)]
    struct TestPlugins {
        pub events: Mutex<Vec<String>>,
        pub decision: Option<PermissionDecision>,
        pub abort_permissions: bool,
        pub fail: bool,
    }

    #[async_trait]
    impl PluginManager for TestPlugins {
        async fn emit(&self, event: PluginEvent) -> crate::Result<PluginOutcome> {
            self.events.lock().await.push(event.name.clone());
            if self.fail {
                return Err(crate::Error::Plugin("scripted failure".to_string()));
            }
            let mut outcome = PluginOutcome::default();
            if event.name == events::PERMISSION_REQUESTED {
                if self.abort_permissions {
                    outcome.aborted = true;
                } else {
                    outcome.permission_decision = self.decision.clone();
                }
            }
            Ok(outcome)
        }
    }

    async fn make_hub(plugins: Option<Arc<TestPlugins>>) -> (Arc<Hub>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().to_path_buf()).unwrap();
        let hub = Hub::new(
            store,
            LimitsConfig::default(),
            BridgeHooks::default(),
            plugins.map(|p| p as Arc<dyn PluginManager>),
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

    fn can_use_tool(request_id: &str) -> UpstreamMessage {
        crate::bridge::types::parse_ndjson(&format!(
            r#"{{"type":"control_request","request_id":"{}","request":{{"subtype":"can_use_tool","tool_name":"Bash","input":{{"command":"ls"}},"tool_use_id":"tu1"}}}}"#,
            request_id
        ))
        .remove(0)
    }

    fn system_init() -> UpstreamMessage {
        crate::bridge::types::parse_ndjson(
            r#"{"type":"system","subtype":"init","session_id":"cli-1","cwd":"","tools":["Bash"],"model":"claude-sonnet-4-20250514","permissionMode":"default","version":"2.0.1"}"#,
        )
        .remove(0)
    }

    fn result_ok() -> UpstreamMessage {
        crate::bridge::types::parse_ndjson(
            r#"{"type":"result","subtype":"success","is_error":false,"num_turns":1,"total_cost_usd":0.05,"modelUsage":{"m":{"inputTokens":10000,"outputTokens":10000,"contextWindow":200000}}}"#,
        )
        .remove(0)
    }

    #[tokio::test]
    async fn test_system_init_updates_state_and_notifies_launcher() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().to_path_buf()).unwrap();
        let (sid_tx, mut sid_rx) = mpsc::unbounded_channel();
        let hub = Hub::new(
            store,
            LimitsConfig::default(),
            BridgeHooks {
                cli_session_id: Some(sid_tx),
                ..Default::default()
            },
            None,
        );
        hub.ensure_session("s1", None).await;

        hub.handle_cli_message("s1", system_init()).await;

        let snapshot = hub.snapshot("s1").await.unwrap();
        assert_eq!(snapshot.model, "claude-sonnet-4-20250514");
        assert_eq!(snapshot.tools, vec!["Bash"]);
        assert_eq!(snapshot.version, "2.0.1");
        assert_eq!(
            sid_rx.try_recv().unwrap(),
            ("s1".to_string(), "cli-1".to_string())
        );

        let session = hub.get("s1").await.unwrap();
        assert_eq!(
            session.inner.lock().await.cli_session_id.as_deref(),
            Some("cli-1")
        );
    }

    #[tokio::test]
    async fn test_system_status_sets_compacting() {
        let (hub, _dir) = make_hub(None).await;
        hub.ensure_session("s1", None).await;

        let msg = crate::bridge::types::parse_ndjson(
            r#"{"type":"system","subtype":"status","status":"compacting"}"#,
        )
        .remove(0);
        hub.handle_cli_message("s1", msg).await;
        assert!(hub.snapshot("s1").await.unwrap().is_compacting);

        let msg = crate::bridge::types::parse_ndjson(
            r#"{"type":"system","subtype":"status","status":"idle"}"#,
        )
        .remove(0);
        hub.handle_cli_message("s1", msg).await;
        assert!(!hub.snapshot("s1").await.unwrap().is_compacting);
    }

    #[tokio::test]
    async fn test_assistant_appends_history_and_broadcasts() {
        let (hub, _dir) = make_hub(None).await;
        hub.ensure_session("s1", None).await;
        let (btx, mut brx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", btx).await;
        let _ = frames(&mut brx);

        let msg = crate::bridge::types::parse_ndjson(
            r#"{"type":"assistant","message":{"id":"m1","role":"assistant","model":"claude-sonnet-4-20250514","content":[{"type":"text","text":"Hi"}],"stop_reason":"end_turn"},"parent_tool_use_id":null}"#,
        )
        .remove(0);
        hub.handle_cli_message("s1", msg).await;

        let session = hub.get("s1").await.unwrap();
        assert_eq!(session.inner.lock().await.history.len(), 1);
        let seen = frames(&mut brx);
        assert!(seen.iter().any(|f| f["type"] == "assistant"));
    }

    #[tokio::test]
    async fn test_result_updates_usage_and_fires_first_turn_once() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().to_path_buf()).unwrap();
        let (ft_tx, mut ft_rx) = mpsc::unbounded_channel();
        let hub = Hub::new(
            store,
            LimitsConfig::default(),
            BridgeHooks {
                first_turn: Some(ft_tx),
                ..Default::default()
            },
            None,
        );
        let session = hub.ensure_session("s1", None).await;
        session.inner.lock().await.history.push(HistoryEntry::User {
            id: "u1".to_string(),
            content: "rename the module".to_string(),
            images: None,
            timestamp: 0,
        });

        hub.handle_cli_message("s1", result_ok()).await;

        let snapshot = hub.snapshot("s1").await.unwrap();
        assert_eq!(snapshot.num_turns, 1);
        assert!((snapshot.total_cost_usd - 0.05).abs() < 1e-9);
        assert!((snapshot.context_used_percent - 10.0).abs() < 0.01);
        assert_eq!(
            ft_rx.try_recv().unwrap(),
            ("s1".to_string(), "rename the module".to_string())
        );

        // Second result must not fire the hook again
        hub.handle_cli_message("s1", result_ok()).await;
        assert!(ft_rx.try_recv().is_err());
        assert!(session.inner.lock().await.auto_naming_done);
    }

    #[tokio::test]
    async fn test_error_result_does_not_fire_first_turn() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path().to_path_buf()).unwrap();
        let (ft_tx, mut ft_rx) = mpsc::unbounded_channel();
        let hub = Hub::new(
            store,
            LimitsConfig::default(),
            BridgeHooks {
                first_turn: Some(ft_tx),
                ..Default::default()
            },
            None,
        );
        let session = hub.ensure_session("s1", None).await;
        session.inner.lock().await.history.push(HistoryEntry::User {
            id: "u1".to_string(),
            content: "hi".to_string(),
            images: None,
            timestamp: 0,
        });

        let (btx, mut brx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", btx).await;
        let _ = frames(&mut brx);

        let msg = crate::bridge::types::parse_ndjson(
            r#"{"type":"result","subtype":"error","is_error":true,"errors":["boom"]}"#,
        )
        .remove(0);
        hub.handle_cli_message("s1", msg).await;
        assert!(ft_rx.try_recv().is_err());
        assert!(!session.inner.lock().await.auto_naming_done);

        // The failure is durable and surfaced
        let seen = frames(&mut brx);
        assert!(seen
            .iter()
            .any(|f| f["type"] == "error" && f["message"] == "boom"));
        let snapshot = session.inner.lock().await.history.snapshot();
        assert!(matches!(
            snapshot.last().unwrap(),
            HistoryEntry::SystemError { .. }
        ));
    }

    #[tokio::test]
    async fn test_stream_event_broadcast_not_stored() {
        let (hub, _dir) = make_hub(None).await;
        hub.ensure_session("s1", None).await;
        let (btx, mut brx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", btx).await;
        let _ = frames(&mut brx);

        let msg = crate::bridge::types::parse_ndjson(
            r#"{"type":"stream_event","event":{"type":"content_block_delta"},"parent_tool_use_id":null}"#,
        )
        .remove(0);
        hub.handle_cli_message("s1", msg).await;

        let session = hub.get("s1").await.unwrap();
        assert_eq!(session.inner.lock().await.history.len(), 0);
        let seen = frames(&mut brx);
        assert!(seen.iter().any(|f| f["type"] == "stream_event"));
    }

    #[tokio::test]
    async fn test_control_request_without_plugins_prompts_browsers() {
        let (hub, _dir) = make_hub(None).await;
        hub.ensure_session("s1", None).await;
        let (btx, mut brx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", btx).await;
        let _ = frames(&mut brx);

        hub.handle_cli_message("s1", can_use_tool("r1")).await;

        let session = hub.get("s1").await.unwrap();
        assert!(session.inner.lock().await.pending_perms.contains("r1"));
        let seen = frames(&mut brx);
        let req = seen
            .iter()
            .find(|f| f["type"] == "permission_request")
            .unwrap();
        assert_eq!(req["request"]["request_id"], "r1");
        assert_eq!(req["request"]["tool_name"], "Bash");
    }

    #[tokio::test]
    async fn test_control_request_with_plugin_allow_decision() {
        let plugins = Arc::new(TestPlugins {
            decision: Some(PermissionDecision {
                behavior: "allow".to_string(),
                message: None,
                updated_input: None,
                plugin_id: Some("auto-approver".to_string()),
            }),
            ..Default::default()
        });
        let (hub, _dir) = make_hub(Some(plugins.clone())).await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;
        let (btx, mut brx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", btx).await;
        let _ = frames(&mut brx);

        hub.handle_cli_message("s1", can_use_tool("r1")).await;

        // Upstream gets the synthesized allow with the original input
        let line = cli_rx.try_recv().unwrap();
        let wire: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(wire["type"], "control_response");
        assert_eq!(wire["response"]["request_id"], "r1");
        assert_eq!(wire["response"]["response"]["behavior"], "allow");
        assert_eq!(wire["response"]["response"]["updatedInput"]["command"], "ls");

        // Nothing pending, no browser prompt, automated insight surfaced
        let session = hub.get("s1").await.unwrap();
        assert!(session.inner.lock().await.pending_perms.is_empty());
        let seen = frames(&mut brx);
        assert!(!seen.iter().any(|f| f["type"] == "permission_request"));
        assert!(seen.iter().any(|f| f["type"] == "plugin_insight"));

        let names = plugins.events.lock().await.clone();
        assert!(names.contains(&events::PERMISSION_REQUESTED.to_string()));
        assert!(names.contains(&events::PERMISSION_RESPONDED.to_string()));
    }

    #[tokio::test]
    async fn test_control_request_with_plugin_abort_denies() {
        let plugins = Arc::new(TestPlugins {
            abort_permissions: true,
            ..Default::default()
        });
        let (hub, _dir) = make_hub(Some(plugins)).await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        hub.handle_cli_message("s1", can_use_tool("r1")).await;

        let line = cli_rx.try_recv().unwrap();
        let wire: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(wire["response"]["response"]["behavior"], "deny");
        let session = hub.get("s1").await.unwrap();
        assert!(session.inner.lock().await.pending_perms.is_empty());
    }

    #[tokio::test]
    async fn test_plugin_fault_falls_back_to_human_prompt() {
        let plugins = Arc::new(TestPlugins {
            fail: true,
            ..Default::default()
        });
        let (hub, _dir) = make_hub(Some(plugins)).await;
        hub.ensure_session("s1", None).await;
        let (btx, mut brx) = mpsc::unbounded_channel();
        hub.handle_browser_open("s1", "b1", btx).await;
        let _ = frames(&mut brx);

        hub.handle_cli_message("s1", can_use_tool("r1")).await;

        // The request is not lost: pending and prompted, plus one error insight
        let session = hub.get("s1").await.unwrap();
        assert!(session.inner.lock().await.pending_perms.contains("r1"));
        let seen = frames(&mut brx);
        assert!(seen.iter().any(|f| f["type"] == "permission_request"));
        let errors: Vec<_> = seen
            .iter()
            .filter(|f| f["type"] == "plugin_insight" && f["insight"]["level"] == "error")
            .collect();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_behavior_decision_is_denied() {
        let plugins = Arc::new(TestPlugins {
            decision: Some(PermissionDecision {
                behavior: "maybe".to_string(),
                message: None,
                updated_input: None,
                plugin_id: None,
            }),
            ..Default::default()
        });
        let (hub, _dir) = make_hub(Some(plugins)).await;
        hub.ensure_session("s1", None).await;
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        hub.handle_cli_open("s1", cli_tx).await;

        hub.handle_cli_message("s1", can_use_tool("r1")).await;

        let line = cli_rx.try_recv().unwrap();
        let wire: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(wire["response"]["response"]["behavior"], "deny");
        let msg = wire["response"]["response"]["message"].as_str().unwrap();
        assert!(msg.contains("maybe"));
    }

    #[tokio::test]
    async fn test_control_response_resolves_continuation() {
        let (hub, _dir) = make_hub(None).await;
        let session = hub.ensure_session("s1", None).await;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        session
            .inner
            .lock()
            .await
            .pending_ctrl
            .insert("q1".to_string(), "mcp_status", move |payload| {
                let _ = done_tx.send(payload);
            });

        let msg = crate::bridge::types::parse_ndjson(
            r#"{"type":"control_response","response":{"subtype":"success","request_id":"q1","response":{"mcp_servers":[{"name":"fs","status":"connected"}]}}}"#,
        )
        .remove(0);
        hub.handle_cli_message("s1", msg).await;

        let payload = done_rx.try_recv().unwrap();
        assert_eq!(payload["mcp_servers"][0]["name"], "fs");
        assert!(session.inner.lock().await.pending_ctrl.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_control_response_is_discarded() {
        let (hub, _dir) = make_hub(None).await;
        hub.ensure_session("s1", None).await;
        let msg = crate::bridge::types::parse_ndjson(
            r#"{"type":"control_response","response":{"subtype":"success","request_id":"ghost","response":{}}}"#,
        )
        .remove(0);
        // No panic, no effect
        hub.handle_cli_message("s1", msg).await;
    }

    #[tokio::test]
    async fn test_tool_progress_and_summary_lifecycle() {
        let plugins = Arc::new(TestPlugins::default());
        let (hub, _dir) = make_hub(Some(plugins.clone())).await;
        hub.ensure_session("s1", None).await;

        let progress = r#"{"type":"tool_progress","tool_use_id":"tu1","tool_name":"Bash","parent_tool_use_id":null,"elapsed_time_seconds":1.5}"#;
        hub.handle_cli_message(
            "s1",
            crate::bridge::types::parse_ndjson(progress).remove(0),
        )
        .await;
        hub.handle_cli_message(
            "s1",
            crate::bridge::types::parse_ndjson(progress).remove(0),
        )
        .await;

        // Started only once
        let names = plugins.events.lock().await.clone();
        assert_eq!(
            names
                .iter()
                .filter(|n| *n == events::TOOL_STARTED)
                .count(),
            1
        );

        let summary = r#"{"type":"tool_use_summary","summary":"Listed files","preceding_tool_use_ids":["tu1"]}"#;
        hub.handle_cli_message(
            "s1",
            crate::bridge::types::parse_ndjson(summary).remove(0),
        )
        .await;

        let names = plugins.events.lock().await.clone();
        assert!(names.contains(&events::TOOL_FINISHED.to_string()));
        let session = hub.get("s1").await.unwrap();
        assert!(session.inner.lock().await.started_tools.is_empty());
    }

    #[tokio::test]
    async fn test_keep_alive_and_unknown_are_silent() {
        let (hub, _dir) = make_hub(None).await;
        hub.ensure_session("s1", None).await;
        hub.handle_cli_message("s1", UpstreamMessage::KeepAlive).await;
        hub.handle_cli_message("s1", UpstreamMessage::Unknown).await;
    }
}
