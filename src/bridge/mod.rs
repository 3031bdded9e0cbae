//! The session bridge core
//!
//! Multiplexes one upstream AI coding CLI (or subprocess adapter) with any
//! number of browser observers, per session. Conversation state survives
//! browser reconnects, CLI process deaths, and server restarts.
//!
//! ## Architecture
//!
//! ```text
//! Browser (JSON) ←→ /ws/browser/:id ─┐                  ┌─ /ws/cli/:id ←→ CLI (NDJSON)
//!                                    │   ┌──────────┐   │
//! Browser (JSON) ←→ /ws/browser/:id ─┼──→│   Hub    │←──┤
//!                                    │   │ Session  │   └─ SubprocessAdapter
//!                                    │   │  ├ sequencer (seq + replay ring)
//!                                    │   │  ├ ledger (client_msg_id dedup)
//!                                    │   │  ├ pending (permissions + controls)
//!                                    │   │  ├ history / outbound queue
//!                                    │   │  └ serializer (ordered user msgs)
//!                                    │   └──────────┘
//!                                    │        │ save / restore
//!                                    │   SessionStore (debounced JSON files)
//! ```

pub mod adapter;
pub mod browser;
pub mod cli;
pub mod history;
pub mod hub;
pub mod ledger;
pub mod pending;
pub mod plugin;
pub mod queue;
pub mod sequencer;
pub mod serializer;
pub mod session;
pub mod types;

pub use adapter::SubprocessAdapter;
pub use hub::{BridgeHooks, Hub};
pub use plugin::PluginManager;
pub use session::Session;
