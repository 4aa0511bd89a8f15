use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ConductorError, Result};

/// Thin subprocess wrapper for the worktree-lifecycle contract. The engine
/// assumes no git capability beyond what is exposed here.
pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Git(stderr.trim().to_string()));
        }

        Ok(output)
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    /// Merges a branch. Conflicts are not an error at this level; the caller
    /// decides whether an ambiguous merge escalates to review.
    pub async fn merge(&self, branch: &str, message: &str) -> Result<MergeOutcome> {
        let output = self.run(&["merge", "--no-ff", branch, "-m", message]).await?;

        if output.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("CONFLICT") || stderr.contains("CONFLICT") {
            // Leave the tree clean for whoever resolves it.
            let _ = self.run(&["merge", "--abort"]).await;
            return Ok(MergeOutcome::Conflicted);
        }

        Err(ConductorError::Git(stderr.trim().to_string()))
    }

    /// Commits on `branch` that are not on `base`.
    pub async fn commit_count(&self, base: &str, branch: &str) -> Result<u32> {
        let range = format!("{}..{}", base, branch);
        let output = self.run_checked(&["rev-list", "--count", &range]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse()
            .map_err(|_| ConductorError::Git(format!("unparseable rev-list output: {}", stdout)))
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .run(&["rev-parse", "--verify", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    pub async fn list_branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .run(&["branch", "--list", &format!("{}*", prefix)])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|l| l.trim().trim_start_matches("* ").to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| ConductorError::Other("Invalid path encoding".into()))?;

        let output = if self.branch_exists(branch).await? {
            self.run(&["worktree", "add", path_str, branch]).await?
        } else {
            self.run(&["worktree", "add", "-b", branch, path_str, base])
                .await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Git(stderr.trim().to_string()));
        }

        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| ConductorError::Other("Invalid path encoding".into()))?;

        let output = self
            .run(&["worktree", "remove", "--force", path_str])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Git(stderr.trim().to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge was aborted and needs an external decision.
    Conflicted,
}
