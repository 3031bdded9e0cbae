//! Pending request correlation tables
//!
//! Two directions meet here. `PendingPermissions` tracks unanswered
//! `can_use_tool` requests coming from upstream, addressable by request id
//! until a browser (or plugin automation) answers or the upstream goes away.
//! `PendingControls` tracks bridge-initiated control requests toward upstream
//! whose typed response resolves an in-memory continuation.

use crate::bridge::types::PermissionRequest;
use serde_json::Value;
use std::collections::HashMap;

/// Unanswered upstream permission requests, by request id.
#[derive(Debug, Default)]
pub struct PendingPermissions {
    map: HashMap<String, PermissionRequest>,
}

impl PendingPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(entries: Vec<(String, PermissionRequest)>) -> Self {
        Self {
            map: entries.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, request: PermissionRequest) {
        self.map.insert(request.request_id.clone(), request);
    }

    pub fn remove(&mut self, request_id: &str) -> Option<PermissionRequest> {
        self.map.remove(request_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.map.contains_key(request_id)
    }

    /// Remove and return every pending request (upstream close, session close).
    pub fn drain(&mut self) -> Vec<PermissionRequest> {
        self.map.drain().map(|(_, v)| v).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &PermissionRequest> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries for persistence.
    pub fn snapshot(&self) -> Vec<(String, PermissionRequest)> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Continuation invoked with the response payload of a matched control
/// response. Runs outside the session lock.
pub type ControlContinuation = Box<dyn FnOnce(Value) + Send + 'static>;

/// One awaited control response.
pub struct PendingControl {
    pub subtype: String,
    pub resolve: ControlContinuation,
}

impl std::fmt::Debug for PendingControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingControl")
            .field("subtype", &self.subtype)
            .finish_non_exhaustive()
    }
}

/// Bridge-initiated control requests awaiting their typed response.
/// Unmatched responses are simply discarded by the caller; entries are
/// dropped wholesale when the upstream goes away.
#[derive(Debug, Default)]
pub struct PendingControls {
    map: HashMap<String, PendingControl>,
}

impl PendingControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, request_id: String, subtype: &str, resolve: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.map.insert(
            request_id,
            PendingControl {
                subtype: subtype.to_string(),
                resolve: Box::new(resolve),
            },
        );
    }

    /// Take the continuation for a request id, if one is registered.
    pub fn complete(&mut self, request_id: &str) -> Option<PendingControl> {
        self.map.remove(request_id)
    }

    /// Discard every awaiting continuation (upstream close).
    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn request(id: &str) -> PermissionRequest {
        PermissionRequest {
            request_id: id.to_string(),
            tool_name: "Bash".to_string(),
            input: serde_json::json!({"command": "ls"}),
            permission_suggestions: None,
            description: None,
            tool_use_id: None,
            agent_id: None,
            timestamp: 0,
        }
    }

    #[test]
    fn test_permissions_insert_remove() {
        let mut pending = PendingPermissions::new();
        pending.insert(request("r1"));
        assert!(pending.contains("r1"));
        assert_eq!(pending.len(), 1);

        let removed = pending.remove("r1").unwrap();
        assert_eq!(removed.request_id, "r1");
        assert!(pending.is_empty());
        assert!(pending.remove("r1").is_none());
    }

    #[test]
    fn test_permissions_drain_clears_all() {
        let mut pending = PendingPermissions::new();
        pending.insert(request("r1"));
        pending.insert(request("r2"));
        let drained = pending.drain();
        assert_eq!(drained.len(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_permissions_snapshot_restore_roundtrip() {
        let mut pending = PendingPermissions::new();
        pending.insert(request("r1"));
        let restored = PendingPermissions::restore(pending.snapshot());
        assert!(restored.contains("r1"));
    }

    #[test]
    fn test_controls_complete_invokes_once() {
        let mut pending = PendingControls::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        pending.insert("q1".to_string(), "mcp_status", move |_payload| {
            fired2.store(true, Ordering::SeqCst);
        });

        let ctrl = pending.complete("q1").unwrap();
        assert_eq!(ctrl.subtype, "mcp_status");
        (ctrl.resolve)(serde_json::json!({}));
        assert!(fired.load(Ordering::SeqCst));
        assert!(pending.complete("q1").is_none());
    }

    #[test]
    fn test_controls_clear_discards_continuations() {
        let mut pending = PendingControls::new();
        pending.insert("q1".to_string(), "mcp_status", |_| {});
        pending.clear();
        assert!(pending.is_empty());
        assert!(pending.complete("q1").is_none());
    }
}
