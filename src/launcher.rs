//! CLI process lifecycle management
//!
//! Spawns, kills, relaunches and restores the AI coding CLI processes that
//! back primary sessions. Each process connects back over
//! `--sdk-url ws://127.0.0.1:<port>/ws/cli/<session_id>`. The launcher also
//! drains the bridge's hook channels: resume ids learned from init frames,
//! relaunch requests for sessions that lost their upstream, first-turn
//! completions (auto-naming), and repository-ready notifications.

use crate::bridge::hub::{BridgeHooks, Hub};
use crate::bridge::types::now_millis;
use crate::store::{ProcessRecord, ProcessState, SessionStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};

/// Receiver halves of the bridge hook channels.
pub struct HookReceivers {
    pub cli_session_id: mpsc::UnboundedReceiver<(String, String)>,
    pub relaunch: mpsc::UnboundedReceiver<String>,
    pub first_turn: mpsc::UnboundedReceiver<(String, String)>,
    pub git_ready: mpsc::UnboundedReceiver<(String, String, String)>,
}

/// Build the paired hook channels for a bridge + launcher deployment.
pub fn bridge_hooks() -> (BridgeHooks, HookReceivers) {
    let (sid_tx, sid_rx) = mpsc::unbounded_channel();
    let (relaunch_tx, relaunch_rx) = mpsc::unbounded_channel();
    let (first_turn_tx, first_turn_rx) = mpsc::unbounded_channel();
    let (git_tx, git_rx) = mpsc::unbounded_channel();
    (
        BridgeHooks {
            cli_session_id: Some(sid_tx),
            relaunch: Some(relaunch_tx),
            first_turn: Some(first_turn_tx),
            git_ready: Some(git_tx),
        },
        HookReceivers {
            cli_session_id: sid_rx,
            relaunch: relaunch_rx,
            first_turn: first_turn_rx,
            git_ready: git_rx,
        },
    )
}

/// Manages CLI process lifecycles.
pub struct CliLauncher {
    records: RwLock<HashMap<String, ProcessRecord>>,
    children: RwLock<HashMap<String, Child>>,
    /// Server listen port, for constructing `--sdk-url`
    port: u16,
    store: Arc<SessionStore>,
    binary_override: Option<PathBuf>,
}

impl CliLauncher {
    pub fn new(port: u16, store: Arc<SessionStore>, binary_override: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
            port,
            store,
            binary_override,
        })
    }

    // =========================================================================
    // Spawning
    // =========================================================================

    /// Spawn a fresh CLI process for a session.
    pub async fn spawn(
        self: &Arc<Self>,
        session_id: &str,
        model: Option<String>,
        permission_mode: Option<String>,
        cwd: Option<String>,
    ) -> crate::Result<ProcessRecord> {
        let working_dir = cwd.unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .to_string_lossy()
                .to_string()
        });

        let child = self
            .spawn_process(session_id, &model, &permission_mode, &working_dir, None)
            .await?;
        let pid = child.id();

        let record = ProcessRecord {
            session_id: session_id.to_string(),
            pid,
            state: ProcessState::Starting,
            exit_code: None,
            model,
            permission_mode,
            cwd: working_dir,
            created_at: now_millis(),
            cli_session_id: None,
            name: None,
        };

        self.records
            .write()
            .await
            .insert(session_id.to_string(), record.clone());
        self.children
            .write()
            .await
            .insert(session_id.to_string(), child);
        self.persist_records().await;
        self.spawn_exit_monitor(session_id.to_string(), now_millis(), None);

        Ok(record)
    }

    /// Spawn with `--resume` for session recovery.
    async fn spawn_with_resume(
        self: &Arc<Self>,
        session_id: &str,
        record: &ProcessRecord,
    ) -> crate::Result<()> {
        let resume_id = record.cli_session_id.clone();
        let child = self
            .spawn_process(
                session_id,
                &record.model,
                &record.permission_mode,
                &record.cwd,
                resume_id.as_deref(),
            )
            .await?;
        let pid = child.id();

        {
            let mut records = self.records.write().await;
            if let Some(r) = records.get_mut(session_id) {
                r.pid = pid;
                r.state = ProcessState::Starting;
                r.exit_code = None;
            }
        }
        self.children
            .write()
            .await
            .insert(session_id.to_string(), child);
        self.persist_records().await;
        self.spawn_exit_monitor(session_id.to_string(), now_millis(), resume_id);

        Ok(())
    }

    async fn spawn_process(
        &self,
        session_id: &str,
        model: &Option<String>,
        permission_mode: &Option<String>,
        cwd: &str,
        resume: Option<&str>,
    ) -> crate::Result<Child> {
        let binary = resolve_cli_binary(self.binary_override.as_deref())?;
        let sdk_url = format!("ws://127.0.0.1:{}/ws/cli/{}", self.port, session_id);

        let mut args = vec![
            "--sdk-url".to_string(),
            sdk_url,
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(m) = model {
            args.push("--model".to_string());
            args.push(m.clone());
        }
        if let Some(pm) = permission_mode {
            args.push("--permission-mode".to_string());
            args.push(pm.clone());
        }
        if let Some(resume_id) = resume {
            args.push("--resume".to_string());
            args.push(resume_id.to_string());
        }
        // Headless mode with empty prompt
        args.push("-p".to_string());
        args.push(String::new());

        tracing::info!(
            session_id,
            binary = %binary.display(),
            cwd,
            resume = ?resume,
            "Spawning CLI process"
        );

        Command::new(&binary)
            .args(&args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                crate::Error::Launcher(format!(
                    "Failed to spawn CLI at {}: {}",
                    binary.display(),
                    e
                ))
            })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mark a session's process as connected (its WebSocket arrived).
    pub async fn mark_connected(&self, session_id: &str) {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(session_id) {
                record.state = ProcessState::Connected;
            }
        }
        self.persist_records().await;
    }

    /// Store the upstream's internal session id for `--resume`.
    pub async fn set_cli_session_id(&self, session_id: &str, cli_session_id: String) {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(session_id) {
                record.cli_session_id = Some(cli_session_id);
            }
        }
        self.persist_records().await;
    }

    /// Kill a session's process: graceful first, force after a timeout.
    pub async fn kill(&self, session_id: &str) -> crate::Result<()> {
        let child = self.children.write().await.remove(session_id);
        if let Some(mut child) = child {
            tracing::info!(session_id, "Killing CLI process");
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_err()
            {
                tracing::warn!(session_id, "Force killing CLI process");
                let _ = child.kill().await;
            }
        }

        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(session_id) {
                record.state = ProcessState::Exited;
                record.exit_code = Some(-1);
            }
        }
        self.persist_records().await;
        Ok(())
    }

    /// Kill and respawn with `--resume`.
    pub async fn relaunch(self: &Arc<Self>, session_id: &str) -> crate::Result<()> {
        let record = self.records.read().await.get(session_id).cloned();
        let record = record.ok_or_else(|| {
            crate::Error::Launcher(format!("Session not found: {}", session_id))
        })?;

        self.kill(session_id).await?;
        self.spawn_with_resume(session_id, &record).await
    }

    pub async fn get(&self, session_id: &str) -> Option<ProcessRecord> {
        self.records.read().await.get(session_id).cloned()
    }

    pub async fn all(&self) -> Vec<ProcessRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, session_id: &str) {
        self.records.write().await.remove(session_id);
        self.children.write().await.remove(session_id);
        self.persist_records().await;
    }

    /// Restore process records after a server restart. A recorded pid that
    /// is still alive waits for its WebSocket to reconnect; dead ones are
    /// marked exited and picked up by the watchdog.
    pub async fn restore_from_disk(&self) {
        let records = self.store.load_processes();
        if records.is_empty() {
            tracing::debug!("No launcher state to restore");
            return;
        }
        tracing::info!("Restoring {} CLI process records", records.len());

        let mut map = self.records.write().await;
        for mut record in records {
            match record.pid {
                Some(pid) if is_process_alive(pid) => {
                    record.state = ProcessState::Starting;
                }
                _ => {
                    record.state = ProcessState::Exited;
                    record.exit_code = Some(-1);
                }
            }
            map.insert(record.session_id.clone(), record);
        }
    }

    // =========================================================================
    // Hook consumption and watchdog
    // =========================================================================

    /// Start the hook consumer loops and the reconnect watchdog.
    pub fn start(self: &Arc<Self>, hub: Arc<Hub>, receivers: HookReceivers, watchdog_secs: u64) {
        let HookReceivers {
            mut cli_session_id,
            mut relaunch,
            mut first_turn,
            mut git_ready,
        } = receivers;

        let launcher = self.clone();
        tokio::spawn(async move {
            while let Some((session_id, cli_sid)) = cli_session_id.recv().await {
                launcher.set_cli_session_id(&session_id, cli_sid).await;
                launcher.mark_connected(&session_id).await;
            }
        });

        let launcher = self.clone();
        tokio::spawn(async move {
            while let Some(session_id) = relaunch.recv().await {
                match launcher.relaunch(&session_id).await {
                    Ok(()) => tracing::info!(session_id = %session_id, "Relaunched CLI"),
                    Err(e) => {
                        tracing::debug!(session_id = %session_id, "Relaunch skipped: {}", e)
                    }
                }
            }
        });

        let launcher = self.clone();
        let naming_hub = hub.clone();
        tokio::spawn(async move {
            while let Some((session_id, first_user_text)) = first_turn.recv().await {
                let name = derive_session_name(&first_user_text);
                {
                    let mut records = launcher.records.write().await;
                    if let Some(record) = records.get_mut(&session_id) {
                        record.name = Some(name.clone());
                    }
                }
                launcher.persist_records().await;
                naming_hub.set_session_name(&session_id, &name).await;
                tracing::info!(session_id = %session_id, name = %name, "Session named");
            }
        });

        tokio::spawn(async move {
            while let Some((session_id, cwd, branch)) = git_ready.recv().await {
                tracing::info!(
                    session_id = %session_id,
                    cwd = %cwd,
                    branch = %branch,
                    "Repository ready"
                );
            }
        });

        if watchdog_secs > 0 {
            self.start_reconnect_watchdog(watchdog_secs);
        }
    }

    /// Periodically relaunch sessions whose process never reconnected.
    fn start_reconnect_watchdog(self: &Arc<Self>, interval_secs: u64) {
        let launcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;

                let stale: Vec<String> = {
                    let records = launcher.records.read().await;
                    records
                        .iter()
                        .filter(|(_, r)| r.state == ProcessState::Starting)
                        .filter(|(_, r)| {
                            now_millis().saturating_sub(r.created_at) > interval_secs * 1000
                        })
                        .map(|(id, _)| id.clone())
                        .collect()
                };

                for session_id in stale {
                    tracing::info!(
                        session_id = %session_id,
                        "Reconnect watchdog: relaunching stale session"
                    );
                    if let Err(e) = launcher.relaunch(&session_id).await {
                        tracing::warn!(
                            session_id = %session_id,
                            "Watchdog relaunch failed: {}",
                            e
                        );
                    }
                }
            }
        });
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn persist_records(&self) {
        let records: Vec<ProcessRecord> = self.records.read().await.values().cloned().collect();
        self.store.save_processes(&records);
    }

    /// Watch for process exit; a resume that dies within 5 seconds gets its
    /// stale cli_session_id cleared so the next spawn starts clean.
    fn spawn_exit_monitor(
        self: &Arc<Self>,
        session_id: String,
        spawned_at: u64,
        resume_session_id: Option<String>,
    ) {
        let launcher = self.clone();
        tokio::spawn(async move {
            // Poll instead of holding the children lock across the whole
            // process lifetime; kill() needs that lock to signal the child.
            let exit_code = loop {
                {
                    let mut children = launcher.children.write().await;
                    match children.get_mut(&session_id) {
                        Some(child) => match child.try_wait() {
                            Ok(Some(status)) => {
                                children.remove(&session_id);
                                break status.code();
                            }
                            Ok(None) => {}
                            Err(_) => {
                                children.remove(&session_id);
                                break Some(-1);
                            }
                        },
                        // Killed and reaped elsewhere
                        None => return,
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            };

            let uptime_ms = now_millis().saturating_sub(spawned_at);
            tracing::info!(
                session_id = %session_id,
                exit_code = ?exit_code,
                uptime_ms,
                "CLI process exited"
            );

            {
                let mut records = launcher.records.write().await;
                if let Some(record) = records.get_mut(&session_id) {
                    record.state = ProcessState::Exited;
                    record.exit_code = exit_code;

                    if uptime_ms < 5000 && resume_session_id.is_some() {
                        tracing::warn!(
                            session_id = %session_id,
                            "Resume failed (exited in {}ms), clearing cli_session_id",
                            uptime_ms
                        );
                        record.cli_session_id = None;
                    }
                }
            }

            launcher.persist_records().await;
        });
    }
}

/// Resolve the CLI binary: explicit override, PATH, then known locations.
fn resolve_cli_binary(override_path: Option<&std::path::Path>) -> crate::Result<PathBuf> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(crate::Error::Launcher(format!(
            "Configured CLI binary not found: {}",
            path.display()
        )));
    }

    if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let candidates = [
        home.join(".claude").join("local").join("claude"),
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
    ];
    for candidate in &candidates {
        if candidate.exists() {
            return Ok(candidate.clone());
        }
    }

    Err(crate::Error::Launcher(
        "CLI binary not found; set launcher.binary in the configuration".to_string(),
    ))
}

/// Check if a process is alive by sending signal 0.
fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Derive a display name from the first user message: first line, capped.
fn derive_session_name(first_user_text: &str) -> String {
    let line = first_user_text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Untitled session");
    let name: String = line.chars().take(60).collect();
    name
}
