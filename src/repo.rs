//! Repository metadata resolution
//!
//! Sessions surface the git branch, worktree flag, repository root and
//! ahead/behind counts of their working directory. Everything is read
//! through `git` subprocesses under one overall timeout; any failure (no
//! git, no repository, no upstream) degrades to zero-valued metadata so
//! resolution can never stall or fail a session.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Overall budget for one resolution pass.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Cached repository facts for a working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoMetadata {
    pub branch: String,
    pub is_worktree: bool,
    pub repo_root: String,
    pub ahead: u32,
    pub behind: u32,
}

/// Resolve repository metadata for `cwd`, bounded by an internal timeout.
pub async fn resolve(cwd: &str) -> RepoMetadata {
    if cwd.is_empty() || !Path::new(cwd).is_dir() {
        return RepoMetadata::default();
    }
    match tokio::time::timeout(RESOLVE_TIMEOUT, resolve_inner(cwd)).await {
        Ok(Some(meta)) => meta,
        Ok(None) => RepoMetadata::default(),
        Err(_) => {
            tracing::debug!(cwd, "Repository metadata resolution timed out");
            RepoMetadata::default()
        }
    }
}

async fn resolve_inner(cwd: &str) -> Option<RepoMetadata> {
    let branch = git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let repo_root = git(cwd, &["rev-parse", "--show-toplevel"]).await?;

    // In a linked worktree the per-checkout git dir differs from the common one
    let git_dir = git(cwd, &["rev-parse", "--absolute-git-dir"]).await;
    let common_dir = git(cwd, &["rev-parse", "--git-common-dir"]).await;
    let is_worktree = match (&git_dir, &common_dir) {
        (Some(own), Some(common)) => {
            !common.is_empty() && !own.ends_with(common) && own != common
        }
        _ => false,
    };

    // Missing upstream is the common case; counts stay zero
    let (ahead, behind) = match git(
        cwd,
        &["rev-list", "--left-right", "--count", "@{upstream}...HEAD"],
    )
    .await
    {
        Some(counts) => parse_ahead_behind(&counts),
        None => (0, 0),
    };

    Some(RepoMetadata {
        branch,
        is_worktree,
        repo_root,
        ahead,
        behind,
    })
}

/// Run one git subcommand, returning trimmed stdout on success.
async fn git(cwd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// `rev-list --left-right --count` prints "<behind>\t<ahead>" for
/// `@{upstream}...HEAD`.
fn parse_ahead_behind(counts: &str) -> (u32, u32) {
    let mut parts = counts.split_whitespace();
    let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (ahead, behind)
}
