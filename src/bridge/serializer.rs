//! Strict-order user message processing
//!
//! Plugin middleware may await I/O while inspecting a user message. Without
//! care, two messages arriving back to back could overtake each other inside
//! those awaits. Each session therefore owns a single-consumer queue: the
//! browser router enqueues parsed messages, and one worker drains them in
//! arrival order, running the middleware and the post-middleware send path
//! for each before touching the next.

use crate::bridge::hub::Hub;
use crate::bridge::types::ImageAttachment;
use serde_json::Value;
use std::sync::Weak;
use tokio::sync::mpsc;

/// A user message waiting its turn.
#[derive(Debug)]
pub struct QueuedUserMessage {
    pub content: String,
    pub images: Option<Vec<ImageAttachment>>,
    /// Original wire form, forwarded verbatim to subprocess adapters.
    pub raw: Value,
}

/// Handle to a session's single-consumer user message queue.
#[derive(Debug)]
pub struct UserMessageSerializer {
    tx: mpsc::UnboundedSender<QueuedUserMessage>,
}

impl UserMessageSerializer {
    /// Spawn the worker for one session. The worker holds only a weak hub
    /// reference; it exits when the session's sender side is dropped or the
    /// hub itself is gone.
    pub fn start(session_id: String, hub: Weak<Hub>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedUserMessage>();
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.process_user_message(&session_id, queued).await;
            }
            tracing::debug!(session_id = %session_id, "User message worker stopped");
        });
        Self { tx }
    }

    /// Enqueue a message; returns false when the worker is gone.
    pub fn enqueue(&self, message: QueuedUserMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}
