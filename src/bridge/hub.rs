//! Session registry and connection lifecycle
//!
//! The `Hub` owns every live [`Session`], mediates socket attach/detach for
//! both sides, restores persisted sessions at startup, and requests a save
//! after each state-changing transition. Cross-component signalling (resume
//! ids, relaunch requests, first-turn completion, repository readiness) goes
//! out over channels so no hook ever runs under a session lock.

use crate::bridge::adapter::AdapterHandle;
use crate::bridge::plugin::{events, PluginInsight, PluginManager, PluginOutcome, PluginEvent};
use crate::bridge::session::{BrowserConn, Session};
use crate::bridge::types::{BackendKind, BrowserFrame, SessionSnapshot};
use crate::config::LimitsConfig;
use crate::store::SessionStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Channel ends the bridge signals into. Every field is optional so tests
/// and embedders wire up only what they observe.
#[derive(Debug, Default)]
pub struct BridgeHooks {
    /// (session_id, cli_session_id): upstream internal id learned from init.
    pub cli_session_id: Option<mpsc::UnboundedSender<(String, String)>>,
    /// session_id: a session with browsers lost its upstream.
    pub relaunch: Option<mpsc::UnboundedSender<String>>,
    /// (session_id, first_user_text): first non-error result landed.
    pub first_turn: Option<mpsc::UnboundedSender<(String, String)>>,
    /// (session_id, cwd, branch): repository metadata became available.
    pub git_ready: Option<mpsc::UnboundedSender<(String, String, String)>>,
}

/// The session registry.
pub struct Hub {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) plugins: Option<Arc<dyn PluginManager>>,
    hooks: BridgeHooks,
    pub(crate) limits: LimitsConfig,
}

impl Hub {
    pub fn new(
        store: Arc<SessionStore>,
        limits: LimitsConfig,
        hooks: BridgeHooks,
        plugins: Option<Arc<dyn PluginManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            plugins,
            hooks,
            limits,
        })
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Get or create a session. An explicit `backend_kind` updates an
    /// existing session; a `None` never does, so an unadorned browser attach
    /// cannot overwrite a deliberately adapter-typed session. The kind never
    /// moves back from subprocess-adapter to primary.
    pub async fn ensure_session(
        self: &Arc<Self>,
        id: &str,
        backend_kind: Option<BackendKind>,
    ) -> Arc<Session> {
        let existing = { self.sessions.read().await.get(id).cloned() };
        if let Some(session) = existing {
            if let Some(kind) = backend_kind {
                let mut inner = session.inner.lock().await;
                if inner.state.backend_kind == BackendKind::SubprocessAdapter
                    && kind == BackendKind::Primary
                {
                    tracing::warn!(
                        session_id = id,
                        "Ignoring backend kind downgrade to primary"
                    );
                } else {
                    inner.state.backend_kind = kind;
                }
            }
            return session;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(id).cloned() {
            return session;
        }
        let session = Arc::new(Session::new(
            id.to_string(),
            &self.limits,
            Arc::downgrade(self),
        ));
        if let Some(kind) = backend_kind {
            // Session is not shared yet; the lock is uncontended.
            session.inner.lock().await.state.backend_kind = kind;
        }
        sessions.insert(id.to_string(), session.clone());
        tracing::info!(session_id = id, "Session created");
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        let session = self.get(id).await?;
        let inner = session.inner.lock().await;
        Some(inner.state.clone())
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.inner.lock().await.state.clone());
        }
        out
    }

    /// Delete a session without touching its sockets. For callers that have
    /// already taken the sockets offline.
    pub async fn remove_session(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    /// Full teardown: cancel pending permissions, close the upstream, ask
    /// the adapter to disconnect, drop every browser, delete the session and
    /// its persisted record.
    pub async fn close_session(&self, id: &str) {
        let removed = { self.sessions.write().await.remove(id) };
        let session = match removed {
            Some(s) => s,
            None => return,
        };

        {
            let mut inner = session.inner.lock().await;
            for perm in inner.pending_perms.drain() {
                inner.broadcast(&BrowserFrame::PermissionCancelled {
                    request_id: perm.request_id,
                });
            }
            inner.pending_ctrl.clear();
            inner.cli_tx = None;
            if let Some(adapter) = inner.adapter.take() {
                tokio::spawn(async move { adapter.disconnect().await });
            }
            inner.browsers.clear();
        }

        self.store.remove(id).await;
        tracing::info!(session_id = id, "Session closed");
    }

    pub async fn close_all(&self) {
        for id in self.session_ids().await {
            self.close_session(&id).await;
        }
    }

    // =========================================================================
    // Restore / persist
    // =========================================================================

    /// Rehydrate every persisted session. Sessions come back with no sockets
    /// attached; repository metadata is refreshed in the background.
    pub async fn restore_from_disk(self: &Arc<Self>) {
        let persisted = self.store.load_all();
        let count = persisted.len();

        for record in persisted {
            let session = Arc::new(Session::restore(
                record,
                &self.limits,
                Arc::downgrade(self),
            ));
            self.sessions
                .write()
                .await
                .insert(session.id.clone(), session.clone());

            let hub = self.clone();
            tokio::spawn(async move {
                hub.refresh_repo(&session).await;
            });
        }

        tracing::info!("Restored {} bridge sessions from disk", count);
    }

    /// Request a durable save of the session's current state.
    pub(crate) async fn persist_session(&self, session: &Arc<Session>) {
        let record = session.inner.lock().await.persisted();
        self.store.save(record).await;
    }

    // =========================================================================
    // CLI connection lifecycle
    // =========================================================================

    /// Upstream socket attached: record the sender, tell browsers, drain the
    /// outbound queue.
    pub async fn handle_cli_open(
        self: &Arc<Self>,
        session_id: &str,
        tx: mpsc::UnboundedSender<String>,
    ) {
        let session = self.ensure_session(session_id, None).await;
        {
            let mut inner = session.inner.lock().await;
            if inner.adapter.is_some() {
                tracing::warn!(
                    session_id,
                    "CLI socket opened on an adapter session; ignoring"
                );
                return;
            }
            inner.cli_tx = Some(tx);
            inner.broadcast(&BrowserFrame::CliConnected);
            inner.drain_outbound();
        }
        self.persist_session(&session).await;
        tracing::info!(session_id, "CLI connected to bridge");
    }

    /// Upstream socket lost: cancel every pending permission, notify
    /// browsers, and ask for a relaunch when someone is still watching.
    pub async fn handle_cli_close(self: &Arc<Self>, session_id: &str) {
        let session = match self.get(session_id).await {
            Some(s) => s,
            None => return,
        };

        let relaunch = {
            let mut inner = session.inner.lock().await;
            inner.cli_tx = None;
            for perm in inner.pending_perms.drain() {
                inner.broadcast(&BrowserFrame::PermissionCancelled {
                    request_id: perm.request_id,
                });
            }
            inner.pending_ctrl.clear();
            inner.broadcast(&BrowserFrame::CliDisconnected);
            !inner.browsers.is_empty() && !inner.state.is_compacting
        };

        self.invoke_plugins(&session, events::SESSION_DISCONNECTED, None, Value::Null)
            .await;

        if relaunch {
            self.hook_relaunch(session_id);
        }
        self.persist_session(&session).await;
        tracing::info!(session_id, "CLI disconnected from bridge");
    }

    // =========================================================================
    // Browser connection lifecycle
    // =========================================================================

    /// Browser socket attached: refresh repository metadata, replay the
    /// snapshot, history and pending permissions, and flag upstream absence.
    pub async fn handle_browser_open(
        self: &Arc<Self>,
        session_id: &str,
        browser_id: &str,
        tx: mpsc::UnboundedSender<String>,
    ) {
        let session = self.ensure_session(session_id, None).await;
        self.refresh_repo(&session).await;

        let relaunch = {
            let mut inner = session.inner.lock().await;
            inner.browsers.insert(
                browser_id.to_string(),
                BrowserConn {
                    tx,
                    last_ack_seq: 0,
                },
            );

            let init = BrowserFrame::SessionInit {
                session: inner.state.clone(),
            };
            inner.send_direct(browser_id, &init);

            if !inner.history.is_empty() {
                let history = BrowserFrame::MessageHistory {
                    messages: inner.history.to_frames(),
                };
                inner.send_direct(browser_id, &history);
            }

            let pending: Vec<_> = inner.pending_perms.values().cloned().collect();
            for request in pending {
                inner.send_direct(browser_id, &BrowserFrame::PermissionRequest { request });
            }

            let adapter_present = inner.adapter.is_some();
            if !inner.upstream_attached() {
                inner.send_direct(browser_id, &BrowserFrame::CliDisconnected);
            }
            inner.cli_tx.is_none() && !adapter_present
        };

        if relaunch {
            self.hook_relaunch(session_id);
        }
        self.persist_session(&session).await;
        tracing::info!(session_id, browser_id, "Browser connected to bridge");
    }

    pub async fn handle_browser_close(&self, session_id: &str, browser_id: &str) {
        if let Some(session) = self.get(session_id).await {
            session.inner.lock().await.browsers.remove(browser_id);
        }
        tracing::debug!(session_id, browser_id, "Browser disconnected from bridge");
    }

    // =========================================================================
    // Adapter attachment
    // =========================================================================

    /// Install a subprocess adapter as the session's upstream. The backend
    /// kind flips to subprocess-adapter and stays there for the session's
    /// lifetime.
    pub async fn attach_adapter(self: &Arc<Self>, session_id: &str, adapter: AdapterHandle) {
        let session = self
            .ensure_session(session_id, Some(BackendKind::SubprocessAdapter))
            .await;
        {
            let mut inner = session.inner.lock().await;
            inner.cli_tx = None;
            inner.adapter = Some(adapter);
            inner.broadcast(&BrowserFrame::CliConnected);
        }
        self.persist_session(&session).await;
        tracing::info!(session_id, "Subprocess adapter attached");
    }

    /// Translated upstream message from the adapter; routed exactly like a
    /// parsed CLI socket message.
    pub async fn adapter_message(
        self: &Arc<Self>,
        session_id: &str,
        message: crate::bridge::types::UpstreamMessage,
    ) {
        self.handle_cli_message(session_id, message).await;
    }

    /// Session metadata callback from the adapter.
    pub async fn adapter_update_metadata(
        self: &Arc<Self>,
        session_id: &str,
        model: Option<String>,
        cwd: Option<String>,
    ) {
        let session = match self.get(session_id).await {
            Some(s) => s,
            None => return,
        };
        {
            let mut inner = session.inner.lock().await;
            if let Some(model) = model {
                inner.state.model = model;
            }
            if let Some(cwd) = cwd {
                inner.state.cwd = cwd;
            }
            let snapshot = inner.state.clone();
            inner.broadcast(&BrowserFrame::SessionUpdate {
                session: serde_json::to_value(&snapshot).unwrap_or_default(),
            });
        }
        self.refresh_repo(&session).await;
        self.persist_session(&session).await;
    }

    /// Adapter went away; mirrors an upstream socket close, but the backend
    /// kind does not revert.
    pub async fn handle_adapter_close(self: &Arc<Self>, session_id: &str) {
        let session = match self.get(session_id).await {
            Some(s) => s,
            None => return,
        };

        {
            let mut inner = session.inner.lock().await;
            inner.adapter = None;
            for perm in inner.pending_perms.drain() {
                inner.broadcast(&BrowserFrame::PermissionCancelled {
                    request_id: perm.request_id,
                });
            }
            inner.pending_ctrl.clear();
            inner.broadcast(&BrowserFrame::CliDisconnected);
        }

        self.invoke_plugins(&session, events::SESSION_DISCONNECTED, None, Value::Null)
            .await;
        self.persist_session(&session).await;
        tracing::info!(session_id, "Subprocess adapter detached");
    }

    // =========================================================================
    // Plugin invoker
    // =========================================================================

    /// Emit one event to the plugin manager. Returned insights are published
    /// to the session's browsers. A middleware failure is logged, surfaced as
    /// one error insight, and yields `None` so callers take the default path.
    pub(crate) async fn invoke_plugins(
        &self,
        session: &Arc<Session>,
        name: &str,
        correlation_id: Option<String>,
        data: Value,
    ) -> Option<PluginOutcome> {
        let manager = self.plugins.clone()?;
        let backend_kind = session.inner.lock().await.state.backend_kind;
        let event = PluginEvent::new(name, &session.id, backend_kind, correlation_id, data);

        match manager.emit(event).await {
            Ok(outcome) => {
                for insight in &outcome.insights {
                    self.publish_insight(session, insight.clone()).await;
                }
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, event = name, "Plugin middleware failed: {}", e);
                self.publish_insight(
                    session,
                    PluginInsight::error(format!("Plugin middleware failed: {}", e)),
                )
                .await;
                None
            }
        }
    }

    pub(crate) async fn publish_insight(&self, session: &Arc<Session>, insight: PluginInsight) {
        session
            .inner
            .lock()
            .await
            .broadcast(&BrowserFrame::PluginInsight { insight });
    }

    // =========================================================================
    // Repository metadata
    // =========================================================================

    /// Refresh git metadata for the session's working directory. Resolution
    /// happens outside the session lock with its own internal timeout; a
    /// change is broadcast as a session patch.
    pub(crate) async fn refresh_repo(self: &Arc<Self>, session: &Arc<Session>) {
        let cwd = session.inner.lock().await.state.cwd.clone();
        if cwd.is_empty() {
            return;
        }
        let meta = crate::repo::resolve(&cwd).await;

        let notify = {
            let mut inner = session.inner.lock().await;
            let (changed, first_branch) = inner.apply_repo_meta(&meta);
            if changed {
                let snapshot = inner.state.clone();
                inner.broadcast(&BrowserFrame::SessionUpdate {
                    session: serde_json::to_value(&snapshot).unwrap_or_default(),
                });
            }
            first_branch
        };

        if notify {
            self.hook_git_ready(&session.id, &cwd, &meta.branch);
        }
    }

    // =========================================================================
    // Hooks and naming
    // =========================================================================

    pub(crate) fn hook_cli_session_id(&self, session_id: &str, cli_session_id: &str) {
        if let Some(tx) = &self.hooks.cli_session_id {
            let _ = tx.send((session_id.to_string(), cli_session_id.to_string()));
        }
    }

    pub(crate) fn hook_relaunch(&self, session_id: &str) {
        if let Some(tx) = &self.hooks.relaunch {
            let _ = tx.send(session_id.to_string());
        }
    }

    pub(crate) fn hook_first_turn(&self, session_id: &str, first_user_text: &str) {
        if let Some(tx) = &self.hooks.first_turn {
            let _ = tx.send((session_id.to_string(), first_user_text.to_string()));
        }
    }

    pub(crate) fn hook_git_ready(&self, session_id: &str, cwd: &str, branch: &str) {
        if let Some(tx) = &self.hooks.git_ready {
            let _ = tx.send((session_id.to_string(), cwd.to_string(), branch.to_string()));
        }
    }

    /// Push a new display name to the session's browsers.
    pub async fn set_session_name(&self, session_id: &str, name: &str) {
        if let Some(session) = self.get(session_id).await {
            session
                .inner
                .lock()
                .await
                .broadcast(&BrowserFrame::SessionNameUpdate {
                    name: name.to_string(),
                });
        }
    }
}
