//! ClawBridge - Session bridge between browser clients and AI coding CLIs
//!
//! ClawBridge is a long-running server that mediates between browser clients
//! and interactive AI coding CLIs. Per session it multiplexes a single
//! upstream CLI stream with any number of browser observers, preserves
//! conversation state across browser reconnects, CLI process deaths and
//! server restarts, serializes permission-approval round trips, and fans out
//! broadcast events with monotonic sequencing so clients resume without loss
//! or duplication.
//!
//! ## Modules
//!
//! - [`bridge`]: the session bridge core (routing, sequencing, replay,
//!   pending tables, plugin seam, adapter attachment)
//! - [`handler`]: axum HTTP API and WebSocket surfaces
//! - [`launcher`]: CLI process lifecycle (spawn, resume, watchdog)
//! - [`store`]: debounced file-backed session persistence
//! - [`repo`]: bounded git metadata resolution
//! - [`config`]: TOML configuration

pub mod bridge;
pub mod config;
pub mod error;
pub mod handler;
pub mod launcher;
pub mod repo;
pub mod store;

pub use config::BridgeConfig;
pub use error::{Error, Result};
