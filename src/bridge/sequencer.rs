//! Per-session event sequencing and the bounded replay ring
//!
//! Every frame leaving the session toward browsers is tagged with a strictly
//! increasing sequence number. Broadcast frames (minus snapshots and replays)
//! are additionally recorded in a bounded ring so reconnecting browsers can
//! recover small gaps without touching durable storage. Assignment and
//! buffering happen in one call under the session lock, so no consumer ever
//! observes a sequence number whose replayable frame is missing from the ring.

use crate::bridge::types::{BrowserFrame, BufferedEvent};
use serde_json::Value;
use std::collections::VecDeque;

/// Sequence assignment plus the replay ring.
#[derive(Debug)]
pub struct EventSequencer {
    next_seq: u64,
    buffer: VecDeque<BufferedEvent>,
    capacity: usize,
}

impl EventSequencer {
    /// Fresh sequencer; sequence numbers start at 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            buffer: VecDeque::new(),
            capacity,
        }
    }

    /// Rebuild from persisted state. Entries at or beyond `next_seq` and
    /// overflow beyond capacity are discarded from the head.
    pub fn restore(next_seq: u64, events: Vec<BufferedEvent>, capacity: usize) -> Self {
        let next_seq = next_seq.max(1);
        let mut buffer: VecDeque<BufferedEvent> = events
            .into_iter()
            .filter(|e| e.seq < next_seq)
            .collect();
        while buffer.len() > capacity {
            buffer.pop_front();
        }
        Self {
            next_seq,
            buffer,
            capacity,
        }
    }

    /// Next sequence number to be assigned.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Sequence number of the oldest buffered event, if any.
    pub fn earliest_buffered(&self) -> Option<u64> {
        self.buffer.front().map(|e| e.seq)
    }

    /// Tag a broadcast frame: assign the next seq, inject it into the
    /// serialized payload, and record the payload in the ring when the frame
    /// kind is replayable.
    pub fn tag_broadcast(&mut self, frame: &BrowserFrame) -> (u64, Value) {
        let (seq, payload) = self.assign(frame);
        if is_replayable(frame) {
            self.buffer.push_back(BufferedEvent {
                seq,
                frame: payload.clone(),
            });
            while self.buffer.len() > self.capacity {
                self.buffer.pop_front();
            }
        }
        (seq, payload)
    }

    /// Tag a frame destined for a single socket (join snapshots, replays,
    /// pending-permission re-sends). Consumes a seq, never buffers.
    pub fn tag_direct(&mut self, frame: &BrowserFrame) -> (u64, Value) {
        self.assign(frame)
    }

    fn assign(&mut self, frame: &BrowserFrame) -> (u64, Value) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut payload = serde_json::to_value(frame).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize browser frame: {}", e);
            serde_json::json!({ "type": "error", "message": "frame serialization failure" })
        });
        payload["seq"] = seq.into();
        (seq, payload)
    }

    /// Buffered events with seq strictly greater than `last_seq`, oldest
    /// first. Optionally restricted to non-history-backed (transient) kinds.
    pub fn events_after(&self, last_seq: u64, transient_only: bool) -> Vec<BufferedEvent> {
        self.buffer
            .iter()
            .filter(|e| e.seq > last_seq)
            .filter(|e| {
                if transient_only {
                    let kind = e.frame.get("type").and_then(|t| t.as_str()).unwrap_or("");
                    !crate::bridge::types::is_history_backed(kind)
                } else {
                    true
                }
            })
            .cloned()
            .collect()
    }

    /// Snapshot of the ring for persistence.
    pub fn buffered(&self) -> Vec<BufferedEvent> {
        self.buffer.iter().cloned().collect()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered events at or below `seq`. Used by retention callers that
    /// know a prefix can never be replayed again.
    pub fn drop_through(&mut self, seq: u64) {
        while matches!(self.buffer.front(), Some(e) if e.seq <= seq) {
            self.buffer.pop_front();
        }
    }
}

/// Broadcast frames are replayable except snapshots and replays themselves.
pub fn is_replayable(frame: &BrowserFrame) -> bool {
    !matches!(
        frame,
        BrowserFrame::SessionInit { .. }
            | BrowserFrame::MessageHistory { .. }
            | BrowserFrame::EventReplay { .. }
    )
}
