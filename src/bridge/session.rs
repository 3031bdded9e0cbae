//! The per-session aggregate
//!
//! One `Session` is the concurrency unit of the bridge: every mutable piece
//! of per-session state lives behind a single coarse mutex, and all routing
//! code locks it for short, non-blocking critical sections. Sockets are held
//! as channel senders owned by the transport layer; dropping a sender asks
//! the transport to close, the session never closes sockets itself.

use crate::bridge::adapter::AdapterHandle;
use crate::bridge::history::HistoryLog;
use crate::bridge::hub::Hub;
use crate::bridge::ledger::ClientMsgLedger;
use crate::bridge::pending::{PendingControls, PendingPermissions};
use crate::bridge::queue::OutboundQueue;
use crate::bridge::sequencer::EventSequencer;
use crate::bridge::serializer::UserMessageSerializer;
use crate::bridge::types::{BrowserFrame, PersistedSession, SessionSnapshot};
use crate::config::LimitsConfig;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use tokio::sync::{mpsc, Mutex};

/// One attached browser socket.
#[derive(Debug)]
pub struct BrowserConn {
    pub tx: mpsc::UnboundedSender<String>,
    /// Highest seq this socket has acknowledged.
    pub last_ack_seq: u64,
}

/// A live session. Created on first upstream attach, first browser attach,
/// or restore; destroyed only by an explicit registry close.
pub struct Session {
    pub id: String,
    pub(crate) inner: Mutex<SessionInner>,
    pub(crate) serializer: UserMessageSerializer,
}

/// Everything mutable, guarded by the session mutex.
pub struct SessionInner {
    pub state: SessionSnapshot,
    /// Primary upstream transport, when attached.
    pub cli_tx: Option<mpsc::UnboundedSender<String>>,
    /// Subprocess adapter, when attached. Mutually exclusive with `cli_tx`.
    pub adapter: Option<AdapterHandle>,
    pub browsers: HashMap<String, BrowserConn>,
    pub history: HistoryLog,
    pub outbound: OutboundQueue,
    pub pending_perms: PendingPermissions,
    pub pending_ctrl: PendingControls,
    pub sequencer: EventSequencer,
    /// Highest seq acknowledged by any browser.
    pub last_ack_seq: u64,
    pub ledger: ClientMsgLedger,
    /// Tool use ids that already produced a "tool started" event.
    pub started_tools: HashSet<String>,
    pub auto_naming_done: bool,
    /// Upstream's internal session id, learned from system.init.
    pub cli_session_id: Option<String>,
    /// Whether the repository-ready hook fired for the current branch.
    pub repo_notified: bool,
}

impl Session {
    pub fn new(id: String, limits: &LimitsConfig, hub: Weak<Hub>) -> Self {
        let inner = SessionInner {
            state: SessionSnapshot::new(id.clone()),
            cli_tx: None,
            adapter: None,
            browsers: HashMap::new(),
            history: HistoryLog::new(limits.history),
            outbound: OutboundQueue::new(),
            pending_perms: PendingPermissions::new(),
            pending_ctrl: PendingControls::new(),
            sequencer: EventSequencer::new(limits.event_buffer),
            last_ack_seq: 0,
            ledger: ClientMsgLedger::new(limits.processed_client_ids),
            started_tools: HashSet::new(),
            auto_naming_done: false,
            cli_session_id: None,
            repo_notified: false,
        };
        Self {
            serializer: UserMessageSerializer::start(id.clone(), hub),
            id,
            inner: Mutex::new(inner),
        }
    }

    /// Rehydrate a persisted session. No sockets are attached; a session
    /// with recorded turns is treated as already named.
    pub fn restore(persisted: PersistedSession, limits: &LimitsConfig, hub: Weak<Hub>) -> Self {
        let auto_naming_done = persisted.state.num_turns > 0;
        let last_ack_seq = persisted
            .last_ack_seq
            .min(persisted.next_seq.max(1) - 1);
        let inner = SessionInner {
            state: persisted.state,
            cli_tx: None,
            adapter: None,
            browsers: HashMap::new(),
            history: HistoryLog::restore(persisted.history, limits.history),
            outbound: OutboundQueue::restore(persisted.outbound_queue),
            pending_perms: PendingPermissions::restore(persisted.pending_perms),
            pending_ctrl: PendingControls::new(),
            sequencer: EventSequencer::restore(
                persisted.next_seq,
                persisted.event_buffer,
                limits.event_buffer,
            ),
            last_ack_seq,
            ledger: ClientMsgLedger::restore(
                persisted.processed_client_ids,
                limits.processed_client_ids,
            ),
            started_tools: HashSet::new(),
            auto_naming_done,
            cli_session_id: None,
            repo_notified: false,
        };
        Self {
            serializer: UserMessageSerializer::start(persisted.id.clone(), hub),
            id: persisted.id,
            inner: Mutex::new(inner),
        }
    }
}

impl SessionInner {
    /// Whether any upstream is able to take frames right now.
    pub fn upstream_attached(&self) -> bool {
        self.cli_tx.is_some() || self.adapter.as_ref().map(|a| a.is_ready()).unwrap_or(false)
    }

    /// Tag and fan a frame out to every attached browser, recording it in
    /// the replay ring when the kind is replayable. Returns the assigned seq.
    pub fn broadcast(&mut self, frame: &BrowserFrame) -> u64 {
        let (seq, payload) = self.sequencer.tag_broadcast(frame);
        self.send_payload_all(payload.to_string());
        seq
    }

    /// Tag and send a frame to a single browser, bypassing the replay ring.
    pub fn send_direct(&mut self, browser_id: &str, frame: &BrowserFrame) {
        let (_, payload) = self.sequencer.tag_direct(frame);
        let failed = match self.browsers.get(browser_id) {
            Some(conn) => conn.tx.send(payload.to_string()).is_err(),
            None => false,
        };
        if failed {
            self.browsers.remove(browser_id);
            tracing::debug!(session_id = %self.state.session_id, browser_id, "Browser send failed, removed");
        }
    }

    fn send_payload_all(&mut self, payload: String) {
        let mut dead = Vec::new();
        for (id, conn) in &self.browsers {
            if conn.tx.send(payload.clone()).is_err() {
                dead.push(id.clone());
            }
        }
        for id in dead {
            self.browsers.remove(&id);
            tracing::debug!(session_id = %self.state.session_id, browser_id = %id, "Browser send failed, removed");
        }
    }

    /// Serialize a frame toward the primary upstream, or queue it while no
    /// upstream socket is attached.
    pub fn send_to_cli_or_queue(&mut self, wire: &Value) {
        let line = format!("{}\n", wire);
        if let Some(tx) = &self.cli_tx {
            if tx.send(line).is_ok() {
                return;
            }
            tracing::warn!(session_id = %self.state.session_id, "CLI sender closed");
            self.cli_tx = None;
            self.outbound.push(format!("{}\n", wire));
        } else {
            self.outbound.push(line);
            tracing::debug!(session_id = %self.state.session_id, "Upstream not attached, queued frame");
        }
    }

    /// Drain the outbound queue into the attached upstream. A failed line is
    /// requeued at the front and the drain stops.
    pub fn drain_outbound(&mut self) {
        while let Some(line) = self.outbound.pop() {
            let delivered = match &self.cli_tx {
                Some(tx) => tx.send(line.clone()).is_ok(),
                None => false,
            };
            if !delivered {
                self.outbound.requeue_front(line);
                tracing::warn!(session_id = %self.state.session_id, "Outbound drain interrupted");
                break;
            }
        }
    }

    /// Apply freshly resolved repository metadata. Returns `(changed,
    /// first_branch)`; `first_branch` is true the first time a non-empty
    /// branch is observed for this session.
    pub fn apply_repo_meta(&mut self, meta: &crate::repo::RepoMetadata) -> (bool, bool) {
        let changed = self.state.git_branch != meta.branch
            || self.state.is_worktree != meta.is_worktree
            || self.state.repo_root != meta.repo_root
            || self.state.git_ahead != meta.ahead
            || self.state.git_behind != meta.behind;
        self.state.git_branch = meta.branch.clone();
        self.state.is_worktree = meta.is_worktree;
        self.state.repo_root = meta.repo_root.clone();
        self.state.git_ahead = meta.ahead;
        self.state.git_behind = meta.behind;

        let first_branch = !self.repo_notified && !meta.branch.is_empty();
        if first_branch {
            self.repo_notified = true;
        }
        (changed, first_branch)
    }

    /// Build the durable record for this session.
    pub fn persisted(&self) -> PersistedSession {
        PersistedSession {
            id: self.state.session_id.clone(),
            state: self.state.clone(),
            history: self.history.snapshot(),
            outbound_queue: self.outbound.snapshot(),
            pending_perms: self.pending_perms.snapshot(),
            event_buffer: self.sequencer.buffered(),
            next_seq: self.sequencer.next_seq(),
            last_ack_seq: self.last_ack_seq,
            processed_client_ids: self.ledger.ids(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::types::HistoryEntry;

    fn test_session(id: &str) -> Session {
        Session::new(id.to_string(), &LimitsConfig::default(), Weak::new())
    }

    fn attach_browser(inner: &mut SessionInner, id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        inner.browsers.insert(
            id.to_string(),
            BrowserConn {
                tx,
                last_ack_seq: 0,
            },
        );
        rx
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_browsers_with_seq() {
        let session = test_session("s1");
        let mut inner = session.inner.lock().await;
        let mut rx1 = attach_browser(&mut inner, "b1");
        let mut rx2 = attach_browser(&mut inner, "b2");

        inner.broadcast(&BrowserFrame::CliConnected);

        let m1: Value = serde_json::from_str(&rx1.try_recv().unwrap()).unwrap();
        let m2: Value = serde_json::from_str(&rx2.try_recv().unwrap()).unwrap();
        assert_eq!(m1["type"], "cli_connected");
        assert_eq!(m1["seq"], 1);
        assert_eq!(m2["seq"], 1);
    }

    #[tokio::test]
    async fn test_dead_browser_is_removed_others_continue() {
        let session = test_session("s1");
        let mut inner = session.inner.lock().await;
        let rx1 = attach_browser(&mut inner, "b1");
        let mut rx2 = attach_browser(&mut inner, "b2");
        drop(rx1);

        inner.broadcast(&BrowserFrame::CliConnected);

        assert!(!inner.browsers.contains_key("b1"));
        assert!(inner.browsers.contains_key("b2"));
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_send_to_cli_queues_when_detached() {
        let session = test_session("s1");
        let mut inner = session.inner.lock().await;
        inner.send_to_cli_or_queue(&serde_json::json!({"type": "user"}));
        assert_eq!(inner.outbound.len(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        inner.cli_tx = Some(tx);
        inner.drain_outbound();
        assert!(inner.outbound.is_empty());
        let line = rx.try_recv().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"user\""));
    }

    #[tokio::test]
    async fn test_drain_keeps_remainder_on_failure() {
        let session = test_session("s1");
        let mut inner = session.inner.lock().await;
        inner.outbound.push("one\n".to_string());
        inner.outbound.push("two\n".to_string());

        // Sender with no receiver: every send fails
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        inner.cli_tx = Some(tx);
        inner.drain_outbound();

        assert_eq!(inner.outbound.snapshot(), vec!["one\n", "two\n"]);
    }

    #[tokio::test]
    async fn test_persisted_roundtrip() {
        let session = test_session("s1");
        {
            let mut inner = session.inner.lock().await;
            inner.history.push(HistoryEntry::User {
                id: "u1".to_string(),
                content: "hi".to_string(),
                images: None,
                timestamp: 1,
            });
            inner.outbound.push("line\n".to_string());
            inner.ledger.remember("c1");
            inner.broadcast(&BrowserFrame::CliConnected);
            inner.last_ack_seq = 1;
        }

        let persisted = session.inner.lock().await.persisted();
        let restored = Session::restore(persisted.clone(), &LimitsConfig::default(), Weak::new());
        let inner = restored.inner.lock().await;

        assert_eq!(inner.history.len(), 1);
        assert_eq!(inner.outbound.snapshot(), vec!["line\n"]);
        assert!(inner.ledger.seen("c1"));
        assert_eq!(inner.sequencer.next_seq(), persisted.next_seq);
        assert_eq!(inner.last_ack_seq, 1);
        assert_eq!(inner.sequencer.buffer_len(), 1);
    }

    #[tokio::test]
    async fn test_restore_marks_auto_naming_with_turns() {
        let session = test_session("s1");
        let mut persisted = session.inner.lock().await.persisted();
        persisted.state.num_turns = 3;
        let restored = Session::restore(persisted, &LimitsConfig::default(), Weak::new());
        assert!(restored.inner.lock().await.auto_naming_done);
    }

    #[tokio::test]
    async fn test_upstream_attached() {
        let session = test_session("s1");
        let mut inner = session.inner.lock().await;
        assert!(!inner.upstream_attached());
        let (tx, _rx) = mpsc::unbounded_channel();
        inner.cli_tx = Some(tx);
        assert!(inner.upstream_attached());
    }
}
