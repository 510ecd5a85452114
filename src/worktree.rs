//! Post-exit working tree comparison.
//!
//! When the agent exits, viewers get a summary of what the working tree
//! looks like relative to a base branch. Everything here is best-effort:
//! a missing `git`, a non-repository directory, or a slow command all
//! produce `None` rather than an error.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub branch: String,
    pub base: String,
    /// Commits on `branch` not on `base`. `None` when `base` does not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ahead: Option<u32>,
    /// Commits on `base` not on `branch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behind: Option<u32>,
    pub dirty: bool,
}

/// Inspect `cwd` and compare `HEAD` against `base`.
pub async fn inspect(cwd: &Path, base: &str, timeout: Duration) -> Option<WorktreeInfo> {
    let branch = git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"], timeout).await?;
    let range = format!("{base}...HEAD");
    let counts = git(cwd, &["rev-list", "--left-right", "--count", &range], timeout)
        .await
        .and_then(|out| parse_left_right(&out));
    let dirty = git(cwd, &["status", "--porcelain"], timeout)
        .await
        .map(|out| !out.is_empty())
        .unwrap_or(false);

    Some(WorktreeInfo {
        branch,
        base: base.to_string(),
        behind: counts.map(|(behind, _)| behind),
        ahead: counts.map(|(_, ahead)| ahead),
        dirty,
    })
}

/// Parse `git rev-list --left-right --count` output: `<left>\t<right>`.
fn parse_left_right(out: &str) -> Option<(u32, u32)> {
    let mut parts = out.split_whitespace();
    let left = parts.next()?.parse().ok()?;
    let right = parts.next()?.parse().ok()?;
    Some((left, right))
}

async fn git(cwd: &Path, args: &[&str], timeout: Duration) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(out)) if out.status.success() => {
            Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
        }
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "git unavailable");
            None
        }
        Err(_) => {
            tracing::debug!(?args, "git timed out");
            None
        }
    }
}
