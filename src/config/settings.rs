use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ConductorError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub scheduler: SchedulerConfig,
    pub context: ContextConfig,
    pub drift: DriftConfig,
    pub rebase: RebaseConfig,
    pub planning: PlanningConfig,
    pub workspace: WorkspaceConfig,
    pub tooling: ToolingConfig,
    pub backend: BackendConfig,
}

impl ConductorConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("config.toml");
        let config: Self = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = state_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| ConductorError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.scheduler.max_workers == 0 {
            errors.push("scheduler.max_workers must be greater than 0");
        }
        if self.scheduler.max_attempts == 0 {
            errors.push("scheduler.max_attempts must be greater than 0");
        }
        if self.scheduler.poll_timeout_secs == 0 {
            errors.push("scheduler.poll_timeout_secs must be greater than 0");
        }
        if self.scheduler.backend_retries == 0 {
            errors.push("scheduler.backend_retries must be greater than 0");
        }

        if self.context.max_bundle_bytes == 0 {
            errors.push("context.max_bundle_bytes must be greater than 0");
        }
        if self.context.max_transcript_bytes < self.context.max_bundle_bytes {
            errors.push("context.max_transcript_bytes must be at least max_bundle_bytes");
        }
        if self.context.max_constraints == 0 {
            errors.push("context.max_constraints must be greater than 0");
        }
        if self.context.full_file_line_threshold < 3 {
            errors.push("context.full_file_line_threshold must be at least 3");
        }
        if self.context.debris_phrases.is_empty() {
            errors.push("context.debris_phrases must not be empty");
        }

        if !(0.0..=10.0).contains(&self.drift.growth_threshold) {
            errors.push("drift.growth_threshold must be between 0.0 and 10.0");
        }

        if self.rebase.bloat_bytes == 0 {
            errors.push("rebase.bloat_bytes must be greater than 0");
        }
        if self.rebase.duration_multiplier < 1.0 {
            errors.push("rebase.duration_multiplier must be at least 1.0");
        }
        if self.rebase.commit_ceiling == 0 {
            errors.push("rebase.commit_ceiling must be greater than 0");
        }

        if self.planning.role_timeout_secs == 0 {
            errors.push("planning.role_timeout_secs must be greater than 0");
        }

        if self.workspace.op_timeout_secs == 0 {
            errors.push("workspace.op_timeout_secs must be greater than 0");
        }
        if self.workspace.branch_prefix.is_empty() {
            errors.push("workspace.branch_prefix must not be empty");
        }

        if self.backend.agent_cmd.is_empty() {
            errors.push("backend.agent_cmd must not be empty");
        }

        if self.tooling.test_cmd.is_empty()
            || self.tooling.lint_cmd.is_empty()
            || self.tooling.typecheck_cmd.is_empty()
        {
            errors.push("tooling commands must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConductorError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Bounded worker pool size for implementation tasks.
    pub max_workers: usize,
    /// Attempt budget per task before it is marked failed.
    pub max_attempts: u32,
    /// Bound on polling one backend session to a terminal state.
    pub poll_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Retry budget for transient backend errors.
    pub backend_retries: u32,
    pub backend_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_attempts: 3,
            poll_timeout_secs: 600,
            poll_interval_ms: 500,
            backend_retries: 3,
            backend_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Hard cap on the encoded bundle handed to one execution attempt.
    pub max_bundle_bytes: usize,
    /// Hard cap applied when verifying live session transcripts.
    pub max_transcript_bytes: usize,
    pub max_constraints: usize,
    pub max_constraint_chars: usize,
    pub max_pattern_chars: usize,
    pub max_gotchas: usize,
    pub max_gotcha_chars: usize,
    /// More than this many consecutive lines under one file marker is
    /// treated as an embedded full file.
    pub full_file_line_threshold: usize,
    /// Substrings that indicate unfinished exploratory reasoning.
    pub debris_phrases: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_bundle_bytes: 3_000,
            max_transcript_bytes: 24_000,
            max_constraints: 5,
            max_constraint_chars: 100,
            max_pattern_chars: 120,
            max_gotchas: 3,
            max_gotcha_chars: 100,
            full_file_line_threshold: 30,
            debris_phrases: vec![
                "let me".into(),
                "i'll try".into(),
                "let's see".into(),
                "hmm".into(),
                "wait,".into(),
                "actually,".into(),
                "on second thought".into(),
                "trying again".into(),
                "exploring".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Allowed fractional growth over the per-phase baseline (0.5 = 50%).
    pub growth_threshold: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            growth_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebaseConfig {
    /// Context size above which an attempt counts as bloated.
    pub bloat_bytes: usize,
    /// Duration over this multiple of the task estimate counts as messy.
    pub duration_multiplier: f64,
    /// Commit count above this counts as messy.
    pub commit_ceiling: u32,
    /// Regeneration budget; beyond it a success completes and a failure fails.
    pub max_rebase_attempts: u32,
    /// Log substrings that indicate mid-run self-correction.
    pub correction_markers: Vec<String>,
}

impl Default for RebaseConfig {
    fn default() -> Self {
        Self {
            bloat_bytes: 2_500,
            duration_multiplier: 2.0,
            commit_ceiling: 5,
            max_rebase_attempts: 2,
            correction_markers: vec![
                "reverting".into(),
                "undoing".into(),
                "that was wrong".into(),
                "start over".into(),
                "scratch that".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Bound on one planning role reaching a terminal state.
    pub role_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Estimated seconds per task when no explicit estimate exists.
    pub default_task_estimate_secs: u64,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            role_timeout_secs: 900,
            poll_interval_ms: 500,
            default_task_estimate_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub base_branch: String,
    pub branch_prefix: String,
    pub op_timeout_secs: u64,
    pub op_retries: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".into(),
            branch_prefix: "conductor".into(),
            op_timeout_secs: 30,
            op_retries: 2,
        }
    }
}

/// Opaque verification commands supplied by the project. Run with `sh -c`
/// from the probe scratch directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolingConfig {
    pub test_cmd: String,
    pub lint_cmd: String,
    pub typecheck_cmd: String,
    pub smoke_timeout_secs: u64,
}

impl Default for ToolingConfig {
    fn default() -> Self {
        Self {
            test_cmd: "true".into(),
            lint_cmd: "true".into(),
            typecheck_cmd: "true".into(),
            smoke_timeout_secs: 120,
        }
    }
}

/// External agent process driven by the default backend. The command is run
/// with `sh -c`; it reads its prompt from `$CONDUCTOR_PROMPT_FILE` and its
/// stdout becomes the session's last output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub agent_cmd: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            agent_cmd: "cat \"$CONDUCTOR_PROMPT_FILE\"".into(),
        }
    }
}

/// Filesystem layout of the engine's durable state.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub tracks_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: PathBuf) -> Self {
        let state_dir = root.join(".conductor");
        Self {
            tracks_dir: state_dir.join("tracks"),
            worktrees_dir: state_dir.join("worktrees"),
            state_dir,
            root,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(&self.tracks_dir).await?;
        fs::create_dir_all(&self.worktrees_dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ConductorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = ConductorConfig::default();
        config.scheduler.max_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[test]
    fn policy_defaults_exposed() {
        let config = ConductorConfig::default();
        assert_eq!(config.context.max_bundle_bytes, 3_000);
        assert!((config.drift.growth_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_debris_list_rejected() {
        let mut config = ConductorConfig::default();
        config.context.debris_phrases.clear();
        assert!(config.validate().is_err());
    }
}
