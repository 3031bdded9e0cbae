//! Session persistence
//!
//! File-per-session JSON store under a data directory, plus one sidecar file
//! for launcher process records. The bridge requests a save after every
//! state-changing transition; the store absorbs that by parking snapshots in
//! a dirty map and letting a background flusher write them out in batches.

use crate::bridge::types::PersistedSession;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Coalescing window between a save request and the disk write.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(150);

const PROCESSES_FILE: &str = "processes.json";

/// Launcher-side record of one CLI process, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub session_id: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub cwd: String,
    pub created_at: u64,
    /// Upstream's internal session id, used for `--resume`.
    pub cli_session_id: Option<String>,
    pub name: Option<String>,
}

/// CLI process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Process spawned, waiting for its WebSocket to connect
    Starting,
    /// WebSocket connection established
    Connected,
    /// Process terminated
    Exited,
}

/// Debounced file-backed session store.
pub struct SessionStore {
    dir: PathBuf,
    dirty: Mutex<HashMap<String, PersistedSession>>,
    wakeup: Notify,
}

impl SessionStore {
    /// Open (and create) the data directory and start the background
    /// flusher. Must be called from within a tokio runtime.
    pub fn open(dir: PathBuf) -> crate::Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        let store = Arc::new(Self {
            dir,
            dirty: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
        });

        let flusher = store.clone();
        tokio::spawn(async move {
            loop {
                flusher.wakeup.notified().await;
                tokio::time::sleep(FLUSH_DEBOUNCE).await;
                flusher.flush().await;
            }
        });

        Ok(store)
    }

    /// Load every persisted session. Unreadable files are skipped with a
    /// warning so one corrupt record cannot block startup.
    pub fn load_all(&self) -> Vec<PersistedSession> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Failed to read session dir {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_session_file = path.extension().map(|e| e == "json").unwrap_or(false)
                && path
                    .file_name()
                    .map(|n| n != PROCESSES_FILE)
                    .unwrap_or(false);
            if !is_session_file {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<PersistedSession>(&content).map_err(|e| e.to_string())
                }) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!("Skipping unreadable session file {}: {}", path.display(), e);
                }
            }
        }
        sessions
    }

    /// Park a snapshot for the next flush. Repeated saves of the same
    /// session within the debounce window collapse into one write.
    pub async fn save(&self, session: PersistedSession) {
        self.dirty
            .lock()
            .await
            .insert(session.id.clone(), session);
        self.wakeup.notify_one();
    }

    /// Write out everything parked in the dirty map.
    pub async fn flush(&self) {
        let parked: Vec<PersistedSession> = {
            let mut dirty = self.dirty.lock().await;
            dirty.drain().map(|(_, v)| v).collect()
        };
        for session in parked {
            self.write_session(&session);
        }
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_session(&self, session: &PersistedSession) {
        let path = self.session_path(&session.id);
        match serde_json::to_vec_pretty(session) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!("Failed to write {}: {}", path.display(), e);
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, "Failed to serialize session: {}", e);
            }
        }
    }

    /// Remove a session's record, including any parked snapshot.
    pub async fn remove(&self, id: &str) {
        self.dirty.lock().await.remove(id);
        let path = self.session_path(id);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    /// Persist launcher process records.
    pub fn save_processes(&self, records: &[ProcessRecord]) {
        let path = self.dir.join(PROCESSES_FILE);
        match serde_json::to_vec_pretty(records) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!("Failed to write {}: {}", path.display(), e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialize process records: {}", e),
        }
    }

    /// Load launcher process records, empty when none were saved.
    pub fn load_processes(&self) -> Vec<ProcessRecord> {
        let path = self.dir.join(PROCESSES_FILE);
        if !path.exists() {
            return Vec::new();
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }
}
