//! ClawBridge configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main ClawBridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// HTTP/WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Bounded-cache limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// CLI process launcher configuration
    #[serde(default)]
    pub launcher: LauncherConfig,
}

/// Server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18790,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory where session files are written
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs_next::data_dir()
            .or_else(dirs_next::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: base.join("clawbridge").join("sessions"),
        }
    }
}

/// Bounded-cache limits for the per-session caches
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Replay ring capacity (events kept for reconnect replay)
    pub event_buffer: usize,

    /// Processed client message id FIFO capacity
    pub processed_client_ids: usize,

    /// Soft cap on in-memory history entries
    pub history: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            event_buffer: 600,
            processed_client_ids: 1000,
            history: 400,
        }
    }
}

/// CLI process launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Explicit CLI binary path; resolved from PATH when absent
    pub binary: Option<PathBuf>,

    /// Reconnect watchdog interval in seconds (0 disables the watchdog)
    pub watchdog_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            binary: None,
            watchdog_secs: 10,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// no path is given.
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content)
                    .map_err(|e| crate::Error::Config(format!("{}: {}", p.display(), e)))
            }
            None => Ok(Self::default()),
        }
    }
}
