//! Fan-out/fan-in planning.
//!
//! Exactly three roles explore the same input in parallel, each in its own
//! disposable session. The fan-in is a deterministic structured merge over
//! fixed section markers: no generative step, zero cost, zero variance.

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::backlog::{Backlog, Task};
use crate::config::{ContextConfig, PlanningConfig};
use crate::error::{ConductorError, Result};
use crate::session::{AgentBackend, Phase, SessionBroker, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanningRole {
    Specification,
    Architecture,
    RiskQa,
}

impl PlanningRole {
    pub const ALL: [PlanningRole; 3] = [Self::Specification, Self::Architecture, Self::RiskQa];

    fn name(&self) -> &'static str {
        match self {
            Self::Specification => "specification",
            Self::Architecture => "architecture",
            Self::RiskQa => "risk/qa",
        }
    }

    /// The fixed markers this role's output must carry.
    fn sections(&self) -> [&'static str; 2] {
        match self {
            Self::Specification => ["## Objectives", "## Scope"],
            Self::Architecture => ["## Components", "## Interfaces"],
            Self::RiskQa => ["## Risks", "## Test Strategy"],
        }
    }

    fn prompt(&self, context_doc: &str) -> String {
        let (focus, extra) = match self {
            Self::Specification => (
                "Produce the specification view of this work.",
                "List each work item under `## Scope` as `- t-NNN: title (deps: t-..., t-...)`, \
                 ids in execution order, `(deps: none)` when independent.",
            ),
            Self::Architecture => (
                "Produce the architecture view of this work.",
                "Describe the affected components and the interfaces between them.",
            ),
            Self::RiskQa => (
                "Produce the risk and QA view of this work.",
                "Name concrete risks and how each will be tested.",
            ),
        };
        format!(
            "{focus}\n\nYour answer MUST contain exactly these markdown sections: {} and {}.\n{extra}\n\n---\n{context_doc}",
            self.sections()[0],
            self.sections()[1],
        )
    }
}

pub struct PlanningCoordinator<'a, B: AgentBackend> {
    broker: &'a SessionBroker<B>,
    config: PlanningConfig,
}

impl<'a, B: AgentBackend> PlanningCoordinator<'a, B> {
    pub fn new(broker: &'a SessionBroker<B>, config: PlanningConfig) -> Self {
        Self { broker, config }
    }

    /// Runs the full planning phase: fan-out, bounded wait, deterministic
    /// merge, session garbage collection with reconfirmed teardown.
    ///
    /// One failed or timed-out role fails the whole phase; teardown still
    /// runs for every session that was opened, because an undeleted session
    /// contaminates everything downstream.
    pub async fn run_planning(&self, context_doc: &str) -> Result<String> {
        let mut handles = Vec::with_capacity(PlanningRole::ALL.len());
        for _role in PlanningRole::ALL {
            handles.push(self.broker.open(Phase::Planning).await?);
        }

        let outputs = join_all(
            PlanningRole::ALL
                .iter()
                .zip(&handles)
                .map(|(role, handle)| self.run_role(*role, handle, context_doc)),
        )
        .await;

        let teardown = self.gc_sessions(&handles).await;

        // Teardown failure outranks role failure: it is a contamination
        // hazard, not a transient.
        teardown?;

        let mut documents = Vec::with_capacity(outputs.len());
        for (role, output) in PlanningRole::ALL.iter().zip(outputs) {
            documents.push(output.map_err(|e| ConductorError::PlanningRoleFailed {
                role: role.name().to_string(),
                reason: e.to_string(),
            })?);
        }

        let plan = merge_documents(&documents)?;
        info!(
            roles = PlanningRole::ALL.len(),
            bytes = plan.len(),
            "Planning merge complete"
        );
        Ok(plan)
    }

    async fn run_role(
        &self,
        role: PlanningRole,
        handle: &SessionHandle,
        context_doc: &str,
    ) -> Result<String> {
        debug!(role = role.name(), session_id = %handle.id, "Dispatching planning role");

        self.broker
            .backend()
            .prompt(handle, &role.prompt(context_doc))
            .await?;

        self.broker
            .wait_idle(
                handle,
                Duration::from_secs(self.config.role_timeout_secs),
                Duration::from_millis(self.config.poll_interval_ms),
            )
            .await?;

        self.broker.backend().get_last_output(handle).await
    }

    async fn gc_sessions(&self, handles: &[SessionHandle]) -> Result<()> {
        let mut first_err = None;
        for handle in handles {
            if let Err(e) = self.broker.close_confirmed(handle).await {
                warn!(session_id = %handle.id, error = %e, "Planning session teardown failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Concatenates the six fixed sections under one template. Pure text
/// extraction; the backend is never consulted.
pub fn merge_documents(documents: &[String]) -> Result<String> {
    let mut plan = String::from("# Plan\n");

    for (role, document) in PlanningRole::ALL.iter().zip(documents) {
        for marker in role.sections() {
            let body = extract_section(document, marker).ok_or_else(|| {
                ConductorError::PlanningRoleFailed {
                    role: role.name().to_string(),
                    reason: format!("output is missing the {:?} section", marker),
                }
            })?;
            plan.push('\n');
            plan.push_str(marker);
            plan.push('\n');
            plan.push_str(body.trim_end());
            plan.push('\n');
        }
    }

    Ok(plan)
}

/// The body of one `## `-headed section, excluding the header line.
fn extract_section<'d>(document: &'d str, marker: &str) -> Option<&'d str> {
    let start = document
        .lines()
        .scan(0usize, |offset, line| {
            let line_start = *offset;
            *offset += line.len() + 1;
            Some((line_start, line))
        })
        .find(|(_, line)| line.trim() == marker)
        .map(|(line_start, line)| line_start + line.len() + 1)?;

    if start >= document.len() {
        return Some("");
    }
    let rest = &document[start..];
    let end = rest
        .lines()
        .scan(0usize, |offset, line| {
            let line_start = *offset;
            *offset += line.len() + 1;
            Some((line_start, line))
        })
        .find(|(_, line)| line.trim_start().starts_with("## "))
        .map(|(line_start, _)| line_start)
        .unwrap_or(rest.len());

    Some(&rest[..end])
}

/// Builds the backlog from the merged plan's `## Scope` work items.
///
/// Work-item lines have the fixed shape `- t-NNN: title (deps: ...)`; this is
/// part of the merge contract, so backlog generation is as deterministic as
/// the merge itself.
pub fn backlog_from_plan(
    track_id: &str,
    plan: &str,
    context: &ContextConfig,
    default_estimate_secs: u64,
) -> Result<Backlog> {
    let scope = extract_section(plan, "## Scope").ok_or_else(|| {
        ConductorError::Other("plan document has no ## Scope section".into())
    })?;

    let mut backlog = Backlog::new(track_id);
    for line in scope.lines() {
        let Some(item) = line.trim().strip_prefix("- ") else {
            continue;
        };
        let Some(task) = parse_work_item(item, default_estimate_secs) else {
            continue;
        };
        backlog.push(task);
    }

    if backlog.tasks.is_empty() {
        return Err(ConductorError::Other(
            "plan ## Scope section contains no work items".into(),
        ));
    }

    backlog.validate(context)?;
    Ok(backlog)
}

fn parse_work_item(item: &str, default_estimate_secs: u64) -> Option<Task> {
    let (id, rest) = item.split_once(':')?;
    let id = id.trim();
    if !id.starts_with("t-") || !id[2..].chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let rest = rest.trim();
    let (title, deps) = match rest.rsplit_once("(deps:") {
        Some((title, deps_part)) => {
            let deps_part = deps_part.trim_end_matches(')').trim();
            let deps = if deps_part == "none" || deps_part.is_empty() {
                Vec::new()
            } else {
                deps_part
                    .split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .collect()
            };
            (title.trim(), deps)
        }
        None => (rest, Vec::new()),
    };

    if title.is_empty() {
        return None;
    }

    Some(
        Task::new(id, title)
            .with_spec(title.to_string())
            .with_dependencies(deps)
            .with_estimate_secs(default_estimate_secs),
    )
}
