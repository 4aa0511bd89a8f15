use std::collections::BTreeSet;

use super::ContextBundle;
use crate::backlog::Task;
use crate::config::ContextConfig;
use crate::error::{ConductorError, Result};
use crate::session::Phase;

const MAX_TITLE_CHARS: usize = 100;
const MAX_SPEC_CHARS: usize = 1_400;
const MAX_ACCEPTANCE_CHARS: usize = 160;
const MAX_ACCEPTANCE_ENTRIES: usize = 10;
const MAX_SCOPE_ENTRIES: usize = 12;
const ELLIPSIS: char = '…';

/// Measurements over one text blob: a bundle or a live session transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMetrics {
    pub bytes: usize,
    pub file_path_count: usize,
    pub task_ids: BTreeSet<String>,
    pub debris_count: usize,
    pub has_full_file: bool,
}

/// Validates and compresses work-unit context against hard size and content
/// rules.
pub struct ContextGate {
    config: ContextConfig,
}

impl ContextGate {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Builds the bounded payload for one execution attempt.
    ///
    /// Per-field character budgets are applied first, longest field first,
    /// each truncation marked with an ellipsis. The hard total-size check
    /// runs after; exceeding it is a construction-time failure, not a
    /// warning. There is no third outcome.
    pub fn compress(&self, task: &Task) -> Result<ContextBundle> {
        task.validate(&self.config)?;

        let mut sections: Vec<(usize, String)> = Vec::new();

        sections.push((
            MAX_TITLE_CHARS,
            format!("# Task {}: {}", task.id, task.title),
        ));
        if !task.spec.is_empty() {
            sections.push((MAX_SPEC_CHARS, format!("## Spec\n{}", task.spec)));
        }
        if !task.acceptance.is_empty() {
            let items = bullet_list(&task.acceptance, MAX_ACCEPTANCE_ENTRIES);
            sections.push((
                MAX_ACCEPTANCE_CHARS * MAX_ACCEPTANCE_ENTRIES,
                format!("## Acceptance\n{}", items),
            ));
        }
        if !task.scope.is_empty() {
            // Paths are never truncated mid-string; excess entries are dropped.
            let items = bullet_list(&task.scope, MAX_SCOPE_ENTRIES);
            sections.push((usize::MAX, format!("## Scope\n{}", items)));
        }
        if let Some(hints) = &task.hints {
            if !hints.constraints.is_empty() {
                sections.push((
                    self.config.max_constraint_chars * self.config.max_constraints,
                    format!(
                        "## Constraints\n{}",
                        bullet_list(&hints.constraints, self.config.max_constraints)
                    ),
                ));
            }
            if !hints.patterns.is_empty() {
                sections.push((
                    self.config.max_pattern_chars * hints.patterns.len(),
                    format!("## Patterns\n{}", bullet_list(&hints.patterns, usize::MAX)),
                ));
            }
            if !hints.gotchas.is_empty() {
                sections.push((
                    self.config.max_gotcha_chars * self.config.max_gotchas,
                    format!(
                        "## Gotchas\n{}",
                        bullet_list(&hints.gotchas, self.config.max_gotchas)
                    ),
                ));
            }
        }

        // Longest-first, index as tie-breaker so the order is deterministic.
        let mut order: Vec<usize> = (0..sections.len()).collect();
        order.sort_by(|&a, &b| {
            let len_a = sections[a].1.chars().count();
            let len_b = sections[b].1.chars().count();
            len_b.cmp(&len_a).then(a.cmp(&b))
        });
        for idx in order {
            let (budget, text) = &mut sections[idx];
            *text = truncate_chars(text, *budget);
        }

        let payload = sections
            .into_iter()
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join("\n\n");

        if payload.len() > self.config.max_bundle_bytes {
            return Err(ConductorError::ContextTooLarge {
                task_id: task.id.clone(),
                actual: payload.len(),
                budget: self.config.max_bundle_bytes,
            });
        }

        Ok(ContextBundle::new(&task.id, payload))
    }

    /// Pure scan of any text blob; never a network call.
    pub fn scan(&self, text: &str) -> ContextMetrics {
        let lower = text.to_lowercase();
        let debris_count = self
            .config
            .debris_phrases
            .iter()
            .map(|phrase| count_occurrences(&lower, &phrase.to_lowercase()))
            .sum();

        let mut paths = BTreeSet::new();
        let mut task_ids = BTreeSet::new();
        for token in text.split_whitespace() {
            let token = token
                .trim_matches(|c: char| "\"'`()[]{}<>,;".contains(c))
                .trim_end_matches('.');
            if let Some(path) = as_path_token(token) {
                paths.insert(path.to_string());
            }
        }
        collect_task_ids(text, &mut task_ids);

        ContextMetrics {
            bytes: text.len(),
            file_path_count: paths.len(),
            task_ids,
            debris_count,
            has_full_file: self.detect_full_file(text),
        }
    }

    /// Verifies a blob against the phase's content rules. Planning sessions
    /// may explore freely; every other phase must be clean.
    pub fn verify(&self, text: &str, phase: Phase, task_id: &str) -> Result<ContextMetrics> {
        let metrics = self.scan(text);

        if metrics.bytes > self.config.max_transcript_bytes {
            return Err(ConductorError::ContextTooLarge {
                task_id: task_id.to_string(),
                actual: metrics.bytes,
                budget: self.config.max_transcript_bytes,
            });
        }

        if phase != Phase::Planning {
            if metrics.debris_count > 0 {
                let lower = text.to_lowercase();
                let phrase = self
                    .config
                    .debris_phrases
                    .iter()
                    .find(|p| lower.contains(&p.to_lowercase()))
                    .cloned()
                    .unwrap_or_default();
                return Err(ConductorError::PlanningDebrisDetected {
                    task_id: task_id.to_string(),
                    phase: phase.to_string(),
                    phrase,
                });
            }

            if metrics.task_ids.len() > 1 {
                let others: Vec<String> = metrics
                    .task_ids
                    .iter()
                    .filter(|id| id.as_str() != task_id)
                    .cloned()
                    .collect();
                return Err(ConductorError::CrossTaskContamination {
                    task_id: task_id.to_string(),
                    others,
                });
            }

            if metrics.has_full_file {
                return Err(ConductorError::FullFileDetected {
                    task_id: task_id.to_string(),
                });
            }
        }

        Ok(metrics)
    }

    /// More than the configured number of consecutive lines under one file
    /// marker (a bare path line or a named code fence) reads as an embedded
    /// full file.
    fn detect_full_file(&self, text: &str) -> bool {
        let threshold = self.config.full_file_line_threshold;
        let mut in_fence = false;
        let mut run = 0usize;

        for line in text.lines() {
            let trimmed = line.trim();

            if in_fence {
                if trimmed.starts_with("```") {
                    in_fence = false;
                    run = 0;
                } else {
                    run += 1;
                    if run > threshold {
                        return true;
                    }
                }
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("```") {
                // Only fences that name a file count as a file marker.
                if as_path_token(rest.trim()).is_some() {
                    in_fence = true;
                    run = 0;
                }
                continue;
            }

            if run > 0 {
                if trimmed.is_empty() {
                    run = 0;
                } else {
                    run += 1;
                    if run > threshold {
                        return true;
                    }
                }
            } else if !trimmed.is_empty() && as_path_token(trimmed).is_some() {
                run = 1;
            }
        }

        false
    }
}

fn bullet_list(items: &[String], limit: usize) -> String {
    items
        .iter()
        .take(limit)
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// UTF-8 safe character truncation with an ellipsis marker.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push(ELLIPSIS);
    out
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.match_indices(needle).count()
}

/// A token reads as a file path when it has a directory separator and an
/// extension on its last segment. Trailing `:line` references are accepted.
fn as_path_token(token: &str) -> Option<&str> {
    if token.is_empty() || token.contains(' ') || !token.contains('/') {
        return None;
    }
    let path = token.split(':').next().unwrap_or(token);
    let last = path.rsplit('/').next()?;
    if last.contains('.') && !last.ends_with('.') && !path.starts_with("http") {
        Some(path)
    } else {
        None
    }
}

/// Collects `t-NNN` style identifiers on word boundaries.
fn collect_task_ids(text: &str, out: &mut BTreeSet<String>) {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if (bytes[i] == b't' || bytes[i] == b'T')
            && bytes[i + 1] == b'-'
            && (i == 0 || !bytes[i - 1].is_ascii_alphanumeric())
        {
            let mut j = i + 2;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 2 && (j == bytes.len() || !bytes[j].is_ascii_alphanumeric()) {
                out.insert(text[i..j].to_lowercase());
                i = j;
                continue;
            }
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::ContextHints;

    fn gate() -> ContextGate {
        ContextGate::new(ContextConfig::default())
    }

    fn sample_task() -> Task {
        Task::new("t-001", "Add retry budget to the poller")
            .with_spec("Bound session polling with a retry budget and backoff.")
            .with_acceptance(vec![
                "poller stops after the configured budget".into(),
                "each retry is logged with the attempt number".into(),
            ])
            .with_scope(vec!["src/scheduler.rs".into()])
    }

    #[test]
    fn compress_within_budget() {
        let bundle = gate().compress(&sample_task()).unwrap();
        assert!(bundle.byte_len() <= 3_000);
        assert!(bundle.payload().contains("# Task t-001"));
        assert!(bundle.payload().contains("## Acceptance"));
    }

    #[test]
    fn compress_truncates_long_fields_with_marker() {
        let task = sample_task().with_spec("x".repeat(5_000));
        let bundle = gate().compress(&task).unwrap();
        assert!(bundle.payload().contains('…'));
        assert!(bundle.byte_len() <= 3_000);
    }

    #[test]
    fn compress_never_has_a_third_outcome() {
        // Scope entries are not truncated, so enough of them push the bundle
        // over budget and must produce a hard error.
        let long_paths: Vec<String> = (0..12)
            .map(|i| format!("crates/deeply/nested/module/path/file_{:02}/{}.rs", i, "x".repeat(220)))
            .collect();
        let task = sample_task().with_scope(long_paths);
        let err = gate().compress(&task).unwrap_err();
        assert!(matches!(err, ConductorError::ContextTooLarge { .. }));
    }

    #[test]
    fn compress_rejects_malformed_pattern() {
        let task = sample_task().with_hints(ContextHints {
            patterns: vec!["no line range here".into()],
            ..Default::default()
        });
        let err = gate().compress(&task).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidPatternFormat { .. }));
    }

    #[test]
    fn scan_counts_paths_ids_and_debris() {
        let text = "See src/scheduler.rs:42 and src/backlog/mod.rs. \
                    Task t-003 overlaps t-004. Let me explore a bit.";
        let metrics = gate().scan(text);
        assert_eq!(metrics.file_path_count, 2);
        assert_eq!(metrics.task_ids.len(), 2);
        assert!(metrics.debris_count >= 1);
    }

    #[test]
    fn verify_flags_debris_outside_planning() {
        let err = gate()
            .verify("hmm, let me try another approach", Phase::Implementation, "t-001")
            .unwrap_err();
        assert!(matches!(err, ConductorError::PlanningDebrisDetected { .. }));

        // The same text is fine during planning.
        assert!(gate()
            .verify("hmm, let me try another approach", Phase::Planning, "t-001")
            .is_ok());
    }

    #[test]
    fn verify_flags_cross_task_references() {
        let err = gate()
            .verify("progress on t-001 depends on t-007", Phase::Implementation, "t-001")
            .unwrap_err();
        match err {
            ConductorError::CrossTaskContamination { others, .. } => {
                assert_eq!(others, vec!["t-007".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn verify_flags_embedded_full_file() {
        let mut text = String::from("src/scheduler.rs\n");
        for i in 0..40 {
            text.push_str(&format!("line {} of the file body\n", i));
        }
        let err = gate()
            .verify(&text, Phase::Implementation, "t-001")
            .unwrap_err();
        assert!(matches!(err, ConductorError::FullFileDetected { .. }));
    }

    #[test]
    fn fenced_file_block_counts_as_full_file() {
        let mut text = String::from("```src/scheduler.rs\n");
        for _ in 0..40 {
            text.push_str("let x = 1;\n");
        }
        text.push_str("```\n");
        assert!(gate().scan(&text).has_full_file);
    }

    #[test]
    fn short_excerpts_are_not_full_files() {
        let text = "src/scheduler.rs\nfn main() {}\nok\n\nmore prose";
        assert!(!gate().scan(text).has_full_file);
    }

    #[test]
    fn task_id_boundaries() {
        let mut ids = BTreeSet::new();
        collect_task_ids("t-001 att-002 t-3x T-004.", &mut ids);
        assert!(ids.contains("t-001"));
        assert!(ids.contains("t-004"));
        assert!(!ids.contains("t-002"));
        assert!(!ids.contains("t-3"));
    }
}
