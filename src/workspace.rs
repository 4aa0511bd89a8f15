//! Isolated, branch-per-attempt workspaces.
//!
//! A workspace is owned by exactly one task attempt; no cross-task sharing,
//! ever. That exclusivity is a correctness invariant, not an optimization.

use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{ProjectPaths, WorkspaceConfig};
use crate::error::{ConductorError, Result};
use crate::git::{GitRunner, MergeOutcome};

/// A checked-out worktree bound to one task attempt.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub task_id: String,
    pub branch: String,
    pub path: PathBuf,
}

pub struct WorkspaceManager {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    config: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(paths: &ProjectPaths, config: WorkspaceConfig) -> Self {
        Self {
            repo_path: paths.root.clone(),
            worktrees_dir: paths.worktrees_dir.clone(),
            config,
        }
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.repo_path)
    }

    fn branch_name(&self, task_id: &str, attempt: u32) -> String {
        format!("{}/{}-a{}", self.config.branch_prefix, task_id, attempt)
    }

    /// Creates the worktree for one attempt, retrying transient failures
    /// within the configured timeout budget.
    pub async fn acquire(&self, task_id: &str, attempt: u32) -> Result<Workspace> {
        let branch = self.branch_name(task_id, attempt);
        let path = self.worktrees_dir.join(format!("{}-a{}", task_id, attempt));

        if path.exists() {
            debug!(task_id = %task_id, path = %path.display(), "Reusing existing worktree");
            return Ok(Workspace {
                task_id: task_id.to_string(),
                branch,
                path,
            });
        }

        fs::create_dir_all(&self.worktrees_dir).await?;

        let git = self.git();
        let mut last_err = None;
        for retry in 0..=self.config.op_retries {
            let op = git.worktree_add(&path, &branch, &self.config.base_branch);
            match tokio::time::timeout(Duration::from_secs(self.config.op_timeout_secs), op).await {
                Ok(Ok(())) => {
                    info!(task_id = %task_id, branch = %branch, path = %path.display(), "Created workspace");
                    return Ok(Workspace {
                        task_id: task_id.to_string(),
                        branch,
                        path,
                    });
                }
                Ok(Err(e)) => {
                    warn!(task_id = %task_id, retry, error = %e, "Worktree creation failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    last_err = Some(ConductorError::Timeout {
                        operation: format!("worktree add for {}", task_id),
                        seconds: self.config.op_timeout_secs,
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ConductorError::Workspace {
            task_id: task_id.to_string(),
            message: "worktree creation failed".into(),
        }))
    }

    /// Commits on the workspace branch relative to base. Input to the
    /// messiness scoring.
    pub async fn commit_count(&self, workspace: &Workspace) -> Result<u32> {
        self.git()
            .commit_count(&self.config.base_branch, &workspace.branch)
            .await
    }

    /// Merges the attempt into the base branch. A conflicted merge is not an
    /// error; it is the ambiguity signal that sends the task to review.
    pub async fn merge(&self, workspace: &Workspace) -> Result<MergeOutcome> {
        let git = self.git();
        git.checkout(&self.config.base_branch).await?;
        let outcome = git
            .merge(
                &workspace.branch,
                &format!("Merge task {}", workspace.task_id),
            )
            .await?;

        match outcome {
            MergeOutcome::Merged => {
                info!(task_id = %workspace.task_id, branch = %workspace.branch, "Merged workspace");
                self.remove(workspace).await?;
            }
            MergeOutcome::Conflicted => {
                warn!(task_id = %workspace.task_id, branch = %workspace.branch, "Merge conflicted, leaving branch for review");
            }
        }
        Ok(outcome)
    }

    /// Discards the attempt entirely: worktree and branch.
    pub async fn discard(&self, workspace: &Workspace) -> Result<()> {
        self.remove(workspace).await?;
        if self.git().delete_branch(&workspace.branch).await? {
            debug!(branch = %workspace.branch, "Deleted attempt branch");
        }
        Ok(())
    }

    async fn remove(&self, workspace: &Workspace) -> Result<()> {
        if !workspace.path.exists() {
            return Ok(());
        }
        if let Err(e) = self.git().worktree_remove(&workspace.path).await {
            debug!(path = %workspace.path.display(), error = %e, "Worktree remove failed, force removing");
            fs::remove_dir_all(&workspace.path).await?;
        }
        Ok(())
    }

    /// Removes worktrees and branches left behind by earlier runs.
    pub async fn cleanup_orphaned(&self, active_task_ids: &[String]) -> Result<()> {
        if self.worktrees_dir.exists() {
            let mut dir = fs::read_dir(&self.worktrees_dir).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let owner = name.split("-a").next().unwrap_or(&name).to_string();
                if !active_task_ids.contains(&owner) {
                    warn!(path = %entry.path().display(), "Cleaning up orphaned worktree");
                    if let Err(e) = self.git().worktree_remove(&entry.path()).await {
                        debug!(error = %e, "Git worktree remove failed, using force remove");
                        if let Err(e) = fs::remove_dir_all(entry.path()).await {
                            warn!(path = %entry.path().display(), error = %e, "Force remove failed");
                        }
                    }
                }
            }
        }

        let branches = self
            .git()
            .list_branches_with_prefix(&self.config.branch_prefix)
            .await?;
        for branch in branches {
            let task_part = branch
                .trim_start_matches(&format!("{}/", self.config.branch_prefix))
                .split("-a")
                .next()
                .unwrap_or("")
                .to_string();
            if !active_task_ids.contains(&task_part) && self.git().delete_branch(&branch).await? {
                warn!(branch = %branch, "Deleted orphaned branch");
            }
        }

        Ok(())
    }
}
