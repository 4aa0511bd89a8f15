use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::TaskStatus;
use crate::config::ContextConfig;
use crate::error::{ConductorError, Result};

/// One atomic work item. Created by the planning merge or the rebase engine;
/// status and attempts are mutated only through the backlog, spec fields only
/// by the rebase engine. Tasks are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub spec: String,
    pub status: TaskStatus,

    /// Testable acceptance statements, in order.
    #[serde(default)]
    pub acceptance: Vec<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    /// File paths only, never file contents.
    #[serde(default)]
    pub scope: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<ContextHints>,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Wall-clock estimate used by the messiness scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_secs: Option<u64>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            spec: String::new(),
            status: TaskStatus::Pending,
            acceptance: Vec::new(),
            dependencies: Vec::new(),
            scope: Vec::new(),
            hints: None,
            attempts: 0,
            last_error: None,
            estimate_secs: None,
        }
    }

    pub fn with_spec(mut self, spec: impl Into<String>) -> Self {
        self.spec = spec.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_acceptance(mut self, acceptance: Vec<String>) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_hints(mut self, hints: ContextHints) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_estimate_secs(mut self, secs: u64) -> Self {
        self.estimate_secs = Some(secs);
        self
    }

    pub fn estimate(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.estimate_secs.unwrap_or(default_secs))
    }

    /// Construction-time schema check. Invariants on hint counts and the
    /// pattern entry format are enforced here, not at bundle-build time.
    pub fn validate(&self, config: &ContextConfig) -> Result<()> {
        if let Some(hints) = &self.hints {
            hints.validate(&self.id, config)?;
        }
        Ok(())
    }
}

/// Curated execution hints carried on a task. All bounds are hard schema
/// invariants checked at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextHints {
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Entries of the form `path:startLine-endLine - description`.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub gotchas: Vec<String>,
}

impl ContextHints {
    pub fn validate(&self, task_id: &str, config: &ContextConfig) -> Result<()> {
        if self.constraints.len() > config.max_constraints {
            return Err(ConductorError::TooManyHints {
                task_id: task_id.to_string(),
                field: "constraint",
                count: self.constraints.len(),
                limit: config.max_constraints,
            });
        }
        if self.gotchas.len() > config.max_gotchas {
            return Err(ConductorError::TooManyHints {
                task_id: task_id.to_string(),
                field: "gotcha",
                count: self.gotchas.len(),
                limit: config.max_gotchas,
            });
        }
        for entry in &self.patterns {
            if entry.chars().count() > config.max_pattern_chars || !is_pattern_entry(entry) {
                return Err(ConductorError::InvalidPatternFormat {
                    task_id: task_id.to_string(),
                    entry: entry.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty() && self.patterns.is_empty() && self.gotchas.is_empty()
    }
}

/// Checks `path:startLine-endLine - description` without pulling in a regex:
/// a path segment, a colon, two line numbers joined by a dash, then " - ".
fn is_pattern_entry(entry: &str) -> bool {
    let Some((location, description)) = entry.split_once(" - ") else {
        return false;
    };
    if description.trim().is_empty() {
        return false;
    }
    let Some((path, range)) = location.rsplit_once(':') else {
        return false;
    };
    if path.trim().is_empty() {
        return false;
    }
    let Some((start, end)) = range.split_once('-') else {
        return false;
    };
    start.parse::<u64>().is_ok() && end.parse::<u64>().is_ok()
}

/// Outcome of one execution attempt. Ephemeral: consumed by the scheduler for
/// the status transition and by the rebase engine for messiness scoring.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub task_id: String,
    pub attempts: u32,
    pub context_bytes: usize,
    pub duration: Duration,
    pub commit_count: u32,
    pub log: String,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_entry_format() {
        assert!(is_pattern_entry("src/lib.rs:10-42 - error enum layout"));
        assert!(is_pattern_entry("a/b/c.py:1-1 - x"));
        assert!(!is_pattern_entry("src/lib.rs - no line range"));
        assert!(!is_pattern_entry("src/lib.rs:10-42"));
        assert!(!is_pattern_entry(":10-42 - empty path"));
        assert!(!is_pattern_entry("src/lib.rs:ten-42 - words"));
    }

    #[test]
    fn too_many_constraints_rejected() {
        let config = ContextConfig::default();
        let hints = ContextHints {
            constraints: (0..6).map(|i| format!("c{}", i)).collect(),
            ..Default::default()
        };
        let err = hints.validate("t-001", &config).unwrap_err();
        assert!(err.to_string().contains("constraint"));
    }

    #[test]
    fn overlong_pattern_rejected() {
        let config = ContextConfig::default();
        let hints = ContextHints {
            patterns: vec![format!("src/a.rs:1-2 - {}", "x".repeat(130))],
            ..Default::default()
        };
        assert!(hints.validate("t-001", &config).is_err());
    }

    #[test]
    fn valid_hints_accepted() {
        let config = ContextConfig::default();
        let task = Task::new("t-001", "Add parser").with_hints(ContextHints {
            constraints: vec!["keep the public API unchanged".into()],
            patterns: vec!["src/parse.rs:10-30 - tokenizer loop".into()],
            gotchas: vec!["line numbers are 1-based".into()],
        });
        assert!(task.validate(&config).is_ok());
    }
}
