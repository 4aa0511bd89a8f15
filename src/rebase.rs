//! Regenerate-don't-debug.
//!
//! A messy success is still messy: its workspace is discarded and the task is
//! re-run from an improved spec. The improvement step is pure extraction from
//! the attempt's own record; it never asks the backend for anything.

use tracing::{debug, info};

use crate::backlog::{ContextHints, ExecutionResult, Task};
use crate::config::{ContextConfig, RebaseConfig};

/// Why an attempt is considered messy enough to regenerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseReason {
    RepeatAttempt,
    ContextBloat,
    Overrun,
    SelfCorrection,
    CommitChurn,
    Failure,
}

impl std::fmt::Display for RebaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RepeatAttempt => "required more than one attempt",
            Self::ContextBloat => "context exceeded the bloat threshold",
            Self::Overrun => "ran far past its estimate",
            Self::SelfCorrection => "log shows mid-run self-correction",
            Self::CommitChurn => "commit count above ceiling",
            Self::Failure => "attempt failed",
        };
        f.write_str(s)
    }
}

pub struct RebaseEngine {
    config: RebaseConfig,
    context: ContextConfig,
    default_estimate_secs: u64,
}

impl RebaseEngine {
    pub fn new(config: RebaseConfig, context: ContextConfig, default_estimate_secs: u64) -> Self {
        Self {
            config,
            context,
            default_estimate_secs,
        }
    }

    /// Scores one finished attempt. Evaluated on every attempt, success or
    /// failure; any reason at all makes the attempt messy.
    pub fn messiness(&self, task: &Task, result: &ExecutionResult) -> Vec<RebaseReason> {
        let mut reasons = Vec::new();

        if result.attempts > 1 {
            reasons.push(RebaseReason::RepeatAttempt);
        }
        if result.context_bytes > self.config.bloat_bytes {
            reasons.push(RebaseReason::ContextBloat);
        }

        let estimate = task.estimate(self.default_estimate_secs);
        let limit = estimate.as_secs_f64() * self.config.duration_multiplier;
        if result.duration.as_secs_f64() > limit {
            reasons.push(RebaseReason::Overrun);
        }

        let log = result.log.to_lowercase();
        if self
            .config
            .correction_markers
            .iter()
            .any(|marker| log.contains(marker.as_str()))
        {
            reasons.push(RebaseReason::SelfCorrection);
        }

        if result.commit_count > self.config.commit_ceiling {
            reasons.push(RebaseReason::CommitChurn);
        }
        if !result.success {
            reasons.push(RebaseReason::Failure);
        }

        reasons
    }

    pub fn should_rebase(&self, task: &Task, result: &ExecutionResult) -> bool {
        let reasons = self.messiness(task, result);
        if !reasons.is_empty() {
            debug!(task_id = %task.id, reasons = ?reasons, "Attempt scored as messy");
        }
        !reasons.is_empty()
    }

    /// Whether the regeneration budget for this task is spent. First attempt
    /// plus max_rebase_attempts regenerations; beyond that a clean-enough
    /// success completes and a failure fails.
    pub fn budget_exhausted(&self, task: &Task) -> bool {
        task.attempts > self.config.max_rebase_attempts
    }

    /// Produces the improved task for the next regeneration. Pure extraction
    /// from the attempt record: failure lines become constraints, correction
    /// markers become gotchas, the task id never changes.
    pub fn improve_spec(&self, task: &Task, result: &ExecutionResult) -> Task {
        let mut improved = task.clone();
        improved.attempts = result.attempts;
        if !result.success {
            improved.last_error = Some(summarize_failure(&result.log));
        }

        let mut hints = improved.hints.take().unwrap_or_default();
        self.mine_log(result, &mut hints);
        if !hints.is_empty() {
            improved.hints = Some(hints);
        }

        info!(
            task_id = %improved.id,
            attempts = improved.attempts,
            "Prepared improved spec for regeneration"
        );
        improved
    }

    fn mine_log(&self, result: &ExecutionResult, hints: &mut ContextHints) {
        for line in result.log.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lower = trimmed.to_lowercase();

            if self
                .config
                .correction_markers
                .iter()
                .any(|marker| lower.contains(marker.as_str()))
            {
                let gotcha = clip(trimmed, self.context.max_gotcha_chars);
                if hints.gotchas.len() < self.context.max_gotchas
                    && !hints.gotchas.contains(&gotcha)
                {
                    hints.gotchas.push(gotcha);
                }
                continue;
            }

            if lower.contains("error") || lower.contains("failed") || lower.contains("panic") {
                let constraint = format!("avoid: {}", clip(trimmed, self.context.max_constraint_chars.saturating_sub(7)));
                if hints.constraints.len() < self.context.max_constraints
                    && !hints.constraints.contains(&constraint)
                {
                    hints.constraints.push(constraint);
                }
            }
        }
    }
}

fn summarize_failure(log: &str) -> String {
    log.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("attempt failed with no output")
        .chars()
        .take(200)
        .collect()
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn engine() -> RebaseEngine {
        RebaseEngine::new(RebaseConfig::default(), ContextConfig::default(), 600)
    }

    fn clean_result(task_id: &str) -> ExecutionResult {
        ExecutionResult {
            task_id: task_id.to_string(),
            attempts: 1,
            context_bytes: 800,
            duration: Duration::from_secs(300),
            commit_count: 2,
            log: "implemented and verified".into(),
            success: true,
        }
    }

    #[test]
    fn clean_first_attempt_is_not_messy() {
        let task = Task::new("t-001", "Lexer").with_estimate_secs(600);
        assert!(!engine().should_rebase(&task, &clean_result("t-001")));
    }

    #[test]
    fn each_messiness_signal_triggers() {
        let task = Task::new("t-001", "Lexer").with_estimate_secs(600);
        let e = engine();

        let mut r = clean_result("t-001");
        r.attempts = 2;
        assert_eq!(e.messiness(&task, &r), vec![RebaseReason::RepeatAttempt]);

        let mut r = clean_result("t-001");
        r.context_bytes = 2_600;
        assert_eq!(e.messiness(&task, &r), vec![RebaseReason::ContextBloat]);

        let mut r = clean_result("t-001");
        r.duration = Duration::from_secs(1_300);
        assert_eq!(e.messiness(&task, &r), vec![RebaseReason::Overrun]);

        let mut r = clean_result("t-001");
        r.log = "that was wrong, start over".into();
        assert_eq!(e.messiness(&task, &r), vec![RebaseReason::SelfCorrection]);

        let mut r = clean_result("t-001");
        r.commit_count = 6;
        assert_eq!(e.messiness(&task, &r), vec![RebaseReason::CommitChurn]);

        let mut r = clean_result("t-001");
        r.success = false;
        assert_eq!(e.messiness(&task, &r), vec![RebaseReason::Failure]);
    }

    #[test]
    fn messy_success_still_rebases_within_budget() {
        let task = Task::new("t-001", "Lexer").with_estimate_secs(600);
        let e = engine();

        let mut result = clean_result("t-001");
        result.commit_count = 9;
        assert!(result.success);
        assert!(e.should_rebase(&task, &result));
        assert!(!e.budget_exhausted(&task));
    }

    #[test]
    fn budget_exhaustion_after_max_regenerations() {
        let e = engine();
        let mut task = Task::new("t-001", "Lexer");
        task.attempts = 2;
        assert!(!e.budget_exhausted(&task));
        task.attempts = 3;
        assert!(e.budget_exhausted(&task));
    }

    #[test]
    fn improve_spec_keeps_id_and_mines_log() {
        let e = engine();
        let task = Task::new("t-007", "Parser").with_spec("Build the parser.");
        let mut result = clean_result("t-007");
        result.attempts = 2;
        result.success = false;
        result.log = [
            "reverting the grammar change",
            "error: left recursion in rule expr",
            "tests failed",
        ]
        .join("\n");

        let improved = e.improve_spec(&task, &result);

        assert_eq!(improved.id, "t-007");
        assert_eq!(improved.attempts, 2);
        assert_eq!(improved.spec, "Build the parser.");
        let hints = improved.hints.expect("mined hints");
        assert!(hints.gotchas.iter().any(|g| g.contains("reverting")));
        assert!(hints
            .constraints
            .iter()
            .any(|c| c.contains("left recursion")));
        assert!(improved.last_error.is_some());
    }

    #[test]
    fn mined_hints_respect_schema_limits() {
        let e = engine();
        let task = Task::new("t-001", "Lexer");
        let mut result = clean_result("t-001");
        result.log = (0..20)
            .map(|i| format!("error: distinct failure number {i}"))
            .collect::<Vec<_>>()
            .join("\n");

        let improved = e.improve_spec(&task, &result);
        assert!(improved.validate(&ContextConfig::default()).is_ok());
        let hints = improved.hints.unwrap();
        assert!(hints.constraints.len() <= ContextConfig::default().max_constraints);
    }
}
