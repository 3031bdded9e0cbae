//! Subprocess adapter attachment
//!
//! Some upstream backends do not speak newline-delimited JSON over a socket;
//! they run in-process (or behind another transport) and deliver already
//! translated messages. Attaching an adapter replaces the primary ingress
//! path: the adapter feeds [`crate::bridge::types::UpstreamMessage`] values
//! into the same routing the CLI socket would, and browser control messages
//! are forwarded to the adapter in their original JSON form.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// An attached subprocess backend.
///
/// The bridge holds the handle by reference and only ever calls these three
/// methods; lifecycle beyond that belongs to whoever installed the adapter.
#[async_trait]
pub trait SubprocessAdapter: Send + Sync {
    /// Forward a browser-originated message in its original JSON form.
    async fn forward(&self, command: Value) -> crate::Result<()>;

    /// Ask the adapter to shut down. The bridge fires and forgets.
    async fn disconnect(&self);

    /// Whether the adapter finished its own initialization handshake.
    /// Browsers joining before that must not trigger a CLI relaunch.
    fn is_ready(&self) -> bool;
}

pub type AdapterHandle = Arc<dyn SubprocessAdapter>;
