//! The backlog: a dependency-ordered set of atomic work items.
//!
//! All status reads and writes go through this aggregate. It is owned by the
//! scheduler behind one serialized path; nothing else mutates task state.

mod status;
mod task;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use status::TaskStatus;
pub use task::{ContextHints, ExecutionResult, Task};

use crate::config::ContextConfig;
use crate::error::{ConductorError, Result};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backlog {
    pub version: u32,
    pub track_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Backlog {
    pub fn new(track_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            track_id: track_id.into(),
            created_at: now,
            updated_at: now,
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
        self.updated_at = Utc::now();
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    fn get_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))
    }

    /// Full invariant check, run at load time before anything is scheduled:
    /// schema version, hint bounds, dependency existence, acyclicity.
    pub fn validate(&self, context: &ContextConfig) -> Result<()> {
        if self.version != SCHEMA_VERSION {
            return Err(ConductorError::SchemaVersion {
                found: self.version,
                expected: SCHEMA_VERSION,
            });
        }

        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        for task in &self.tasks {
            task.validate(context)?;
            for dep in &task.dependencies {
                if !index.contains_key(dep.as_str()) {
                    return Err(ConductorError::UnknownDependency {
                        task_id: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(path) = self.find_cycle(&index) {
            return Err(ConductorError::DependencyCycle { path });
        }

        Ok(())
    }

    /// Depth-first walk over dependency edges, colored by task position.
    /// Returns the cycle as task ids, starting and ending on the repeated
    /// task, when one exists.
    fn find_cycle(&self, index: &HashMap<&str, usize>) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        fn walk(
            at: usize,
            tasks: &[Task],
            index: &HashMap<&str, usize>,
            marks: &mut [Mark],
            trail: &mut Vec<usize>,
        ) -> bool {
            marks[at] = Mark::Open;
            trail.push(at);
            for dep in &tasks[at].dependencies {
                // Unknown deps were rejected before this walk runs.
                let Some(&next) = index.get(dep.as_str()) else {
                    continue;
                };
                match marks[next] {
                    Mark::Open => {
                        trail.push(next);
                        return true;
                    }
                    Mark::New => {
                        if walk(next, tasks, index, marks, trail) {
                            return true;
                        }
                    }
                    Mark::Done => {}
                }
            }
            marks[at] = Mark::Done;
            trail.pop();
            false
        }

        let mut marks = vec![Mark::New; self.tasks.len()];
        for start in 0..self.tasks.len() {
            if marks[start] != Mark::New {
                continue;
            }
            let mut trail = Vec::new();
            if walk(start, &self.tasks, index, &mut marks, &mut trail) {
                let head = *trail.last()?;
                let from = trail.iter().position(|&i| i == head)?;
                return Some(
                    trail[from..]
                        .iter()
                        .map(|&i| self.tasks[i].id.clone())
                        .collect(),
                );
            }
        }
        None
    }

    /// Promotes pending tasks whose dependencies are all completed.
    /// Returns the ids that became ready, in declaration order.
    pub fn refresh_ready(&mut self) -> Vec<String> {
        let completed: HashSet<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();

        let mut promoted = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::Pending
                && task.dependencies.iter().all(|d| completed.contains(d))
            {
                task.status = TaskStatus::Ready;
                promoted.push(task.id.clone());
            }
        }
        if !promoted.is_empty() {
            self.updated_at = Utc::now();
        }
        promoted
    }

    /// Ready tasks in stable declaration order. No further ordering is
    /// guaranteed among them.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect()
    }

    pub fn transition(&mut self, task_id: &str, to: TaskStatus) -> Result<()> {
        let task = self.get_mut(task_id)?;
        if !task.status.can_transition_to(to) {
            return Err(ConductorError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }
        task.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_attempt(&mut self, task_id: &str) -> Result<u32> {
        let task = self.get_mut(task_id)?;
        task.attempts += 1;
        let attempts = task.attempts;
        self.updated_at = Utc::now();
        Ok(attempts)
    }

    pub fn record_error(&mut self, task_id: &str, error: impl Into<String>) -> Result<()> {
        let task = self.get_mut(task_id)?;
        task.last_error = Some(error.into());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replaces a task's spec fields with a regenerated version. Only the
    /// rebase engine produces the replacement; identifier and status are
    /// preserved here.
    pub fn apply_rebase(&mut self, replacement: Task) -> Result<()> {
        let task = self.get_mut(&replacement.id)?;
        task.title = replacement.title;
        task.spec = replacement.spec;
        task.acceptance = replacement.acceptance;
        task.scope = replacement.scope;
        task.hints = replacement.hints;
        task.attempts = replacement.attempts;
        task.last_error = replacement.last_error;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in &self.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_task_backlog() -> Backlog {
        let mut backlog = Backlog::new("track-1");
        backlog.push(Task::new("t-001", "First"));
        backlog.push(Task::new("t-002", "Second").with_dependencies(vec!["t-001".into()]));
        backlog
    }

    #[test]
    fn ready_set_follows_dependencies() {
        let mut backlog = two_task_backlog();

        backlog.refresh_ready();
        let ready: Vec<&str> = backlog.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["t-001"]);

        backlog.transition("t-001", TaskStatus::InProgress).unwrap();
        backlog.transition("t-001", TaskStatus::Completed).unwrap();
        backlog.refresh_ready();

        let ready: Vec<&str> = backlog.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["t-002"]);
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut backlog = Backlog::new("track-1");
        backlog.push(Task::new("t-001", "First").with_dependencies(vec!["t-999".into()]));

        let err = backlog.validate(&ContextConfig::default()).unwrap_err();
        assert!(err.to_string().contains("t-999"));
    }

    #[test]
    fn cycle_rejected_at_validation() {
        let mut backlog = Backlog::new("track-1");
        backlog.push(Task::new("t-001", "A").with_dependencies(vec!["t-002".into()]));
        backlog.push(Task::new("t-002", "B").with_dependencies(vec!["t-001".into()]));

        let err = backlog.validate(&ContextConfig::default()).unwrap_err();
        assert!(matches!(err, ConductorError::DependencyCycle { .. }));
    }

    #[test]
    fn diamond_dependencies_are_acyclic() {
        let mut backlog = Backlog::new("track-1");
        backlog.push(Task::new("t-001", "Top").with_dependencies(vec![
            "t-002".into(),
            "t-003".into(),
        ]));
        backlog.push(Task::new("t-002", "Left").with_dependencies(vec!["t-004".into()]));
        backlog.push(Task::new("t-003", "Right").with_dependencies(vec!["t-004".into()]));
        backlog.push(Task::new("t-004", "Bottom"));

        assert!(backlog.validate(&ContextConfig::default()).is_ok());
    }

    #[test]
    fn cycle_path_starts_and_ends_on_the_same_task() {
        let mut backlog = Backlog::new("track-1");
        backlog.push(Task::new("t-001", "A").with_dependencies(vec!["t-002".into()]));
        backlog.push(Task::new("t-002", "B").with_dependencies(vec!["t-003".into()]));
        backlog.push(Task::new("t-003", "C").with_dependencies(vec!["t-002".into()]));

        let err = backlog.validate(&ContextConfig::default()).unwrap_err();
        match err {
            ConductorError::DependencyCycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path, vec!["t-002", "t-003", "t-002"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_rejected() {
        let mut backlog = Backlog::new("track-1");
        backlog.push(Task::new("t-001", "A").with_dependencies(vec!["t-001".into()]));

        let err = backlog.validate(&ContextConfig::default()).unwrap_err();
        assert!(matches!(err, ConductorError::DependencyCycle { .. }));
    }

    #[test]
    fn counts_groups_by_status() {
        let mut backlog = two_task_backlog();
        backlog.refresh_ready();

        let counts = backlog.counts();
        assert_eq!(counts.get(&TaskStatus::Ready), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Completed), None);
    }

    #[test]
    fn invalid_transition_rejected() {
        let mut backlog = two_task_backlog();
        let err = backlog
            .transition("t-001", TaskStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidTransition { .. }));
    }

    #[test]
    fn declaration_order_is_stable_among_ready() {
        let mut backlog = Backlog::new("track-1");
        backlog.push(Task::new("t-003", "C"));
        backlog.push(Task::new("t-001", "A"));
        backlog.push(Task::new("t-002", "B"));
        backlog.refresh_ready();

        let ready: Vec<&str> = backlog.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["t-003", "t-001", "t-002"]);
    }
}
