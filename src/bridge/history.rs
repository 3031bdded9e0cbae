//! Durable conversation history
//!
//! Append-only log of user, assistant, result and system-error entries.
//! Serves two callers: full-history snapshots for browsers whose sequence gap
//! cannot be covered by the replay ring, and the first-turn hook that needs
//! the first user message once the first non-error result lands. Retention
//! trims only the head; the tail is never touched.

use crate::bridge::types::{BrowserFrame, HistoryEntry};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
    soft_limit: usize,
}

impl HistoryLog {
    pub fn new(soft_limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            soft_limit,
        }
    }

    pub fn restore(entries: Vec<HistoryEntry>, soft_limit: usize) -> Self {
        let mut log = Self::new(soft_limit);
        for entry in entries {
            log.push(entry);
        }
        log
    }

    /// Append an entry, trimming the head past the soft limit.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.soft_limit {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the full log as replayable browser frames, oldest first.
    pub fn to_frames(&self) -> Vec<BrowserFrame> {
        self.entries.iter().map(HistoryEntry::to_frame).collect()
    }

    /// Text of the earliest user message still retained.
    pub fn first_user_text(&self) -> Option<String> {
        self.entries.iter().find_map(|e| match e {
            HistoryEntry::User { content, .. } => Some(content.clone()),
            _ => None,
        })
    }

    /// Entries for persistence, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
