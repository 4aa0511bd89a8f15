//! The orchestration loop.
//!
//! One serialized mutator owns the backlog and the durable writes; a bounded
//! pool of workers runs execution attempts that never touch shared state.
//! Workers report an outcome, the loop applies it as a status transition and
//! persists the backlog before dispatching anything else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backlog::{Backlog, ExecutionResult, Task, TaskStatus};
use crate::config::{ConductorConfig, ProjectPaths};
use crate::context::ContextGate;
use crate::drift::{Checkpoint, DriftMonitor};
use crate::error::{ConductorError, Result};
use crate::git::MergeOutcome;
use crate::probe::HealthProbe;
use crate::rebase::RebaseEngine;
use crate::repo::SpecRepository;
use crate::session::{AgentBackend, Phase, SessionBroker};
use crate::workspace::{Workspace, WorkspaceManager};

/// Final tally of one orchestration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub review: usize,
    pub total: usize,
}

/// What one worker hands back to the mutator loop. Errors are folded into a
/// synthetic failed result so the rebase engine can mine them like any other
/// attempt record.
struct AttemptOutcome {
    task_id: String,
    workspace: Option<Workspace>,
    result: ExecutionResult,
    error: Option<ConductorError>,
    cancelled: bool,
}

/// Shared, immutable services the workers run against.
struct WorkerContext<B: AgentBackend> {
    broker: SessionBroker<B>,
    gate: ContextGate,
    drift: DriftMonitor,
    workspaces: WorkspaceManager,
    config: ConductorConfig,
}

pub struct Scheduler<B: AgentBackend + 'static> {
    ctx: Arc<WorkerContext<B>>,
    repo: SpecRepository,
    probe: HealthProbe,
    rebase: RebaseEngine,
    paths: ProjectPaths,
    cancel: CancellationToken,
}

impl<B: AgentBackend + 'static> Scheduler<B> {
    pub fn new(
        config: ConductorConfig,
        paths: ProjectPaths,
        repo: SpecRepository,
        backend: B,
    ) -> Self {
        let rebase = RebaseEngine::new(
            config.rebase.clone(),
            config.context.clone(),
            config.planning.default_task_estimate_secs,
        );
        let ctx = WorkerContext {
            broker: SessionBroker::new(backend),
            gate: ContextGate::new(config.context.clone()),
            drift: DriftMonitor::new(config.drift.clone()),
            workspaces: WorkspaceManager::new(&paths, config.workspace.clone()),
            config: config.clone(),
        };
        Self {
            ctx: Arc::new(ctx),
            repo,
            probe: HealthProbe::new(config.tooling.clone()),
            rebase,
            paths,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run from the outside. Workers tear their
    /// sessions down before the run loop returns.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drives one track to quiescence: every task in a terminal state, or
    /// nothing left that can make progress.
    pub async fn run(&self, track_id: &str) -> Result<RunSummary> {
        let mut backlog = self.repo.load_backlog(track_id).await?;
        backlog.validate(&self.ctx.config.context)?;

        self.ctx.drift.reset();

        // Broken tooling aborts before the first dispatch; retrying against a
        // broken verifier only manufactures failures.
        self.probe.verify_healthy(&self.paths.root).await?;

        let active: Vec<String> = backlog.tasks.iter().map(|t| t.id.clone()).collect();
        if let Err(e) = self.ctx.workspaces.cleanup_orphaned(&active).await {
            warn!(error = %e, "Orphaned workspace cleanup failed, continuing");
        }

        // Attempts interrupted by a previous cancellation were left
        // in_progress; their spec is intact, so they go back in line.
        let interrupted_ids: Vec<String> = backlog
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();
        for id in interrupted_ids {
            info!(task_id = %id, "Requeueing interrupted task");
            backlog.transition(&id, TaskStatus::Rebasing)?;
            backlog.transition(&id, TaskStatus::Ready)?;
        }

        let mut workers: JoinSet<AttemptOutcome> = JoinSet::new();
        let mut interrupted = false;

        loop {
            if !interrupted {
                let promoted = backlog.refresh_ready();
                if !promoted.is_empty() {
                    debug!(promoted = ?promoted, "Tasks became ready");
                }

                while workers.len() < self.ctx.config.scheduler.max_workers {
                    let Some(next) = backlog.ready_tasks().first().map(|t| t.id.clone()) else {
                        break;
                    };
                    backlog.transition(&next, TaskStatus::InProgress)?;
                    backlog.record_attempt(&next)?;
                    self.repo.save_backlog(&backlog).await?;

                    let task = backlog
                        .get(&next)
                        .cloned()
                        .ok_or_else(|| ConductorError::TaskNotFound(next.clone()))?;
                    info!(task_id = %task.id, attempt = task.attempts, "Dispatching task");

                    let ctx = Arc::clone(&self.ctx);
                    let cancel = self.cancel.clone();
                    workers.spawn(async move { execute_attempt(ctx, task, cancel).await });
                }
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !interrupted => {
                    warn!("Run cancelled, draining in-flight workers");
                    interrupted = true;
                }
                joined = workers.join_next() => {
                    let outcome = match joined {
                        Some(Ok(outcome)) => outcome,
                        Some(Err(e)) => {
                            error!(error = %e, "Worker panicked");
                            continue;
                        }
                        None => break,
                    };
                    self.apply_outcome(&mut backlog, outcome).await?;
                    self.repo.save_backlog(&backlog).await?;

                    let counts = backlog.counts();
                    info!(
                        completed = counts.get(&TaskStatus::Completed).copied().unwrap_or(0),
                        failed = counts.get(&TaskStatus::Failed).copied().unwrap_or(0),
                        review = counts.get(&TaskStatus::Review).copied().unwrap_or(0),
                        total = backlog.tasks.len(),
                        "Progress"
                    );
                }
            }
        }

        self.repo.save_backlog(&backlog).await?;

        let counts = backlog.counts();
        let summary = RunSummary {
            completed: counts.get(&TaskStatus::Completed).copied().unwrap_or(0),
            failed: counts.get(&TaskStatus::Failed).copied().unwrap_or(0),
            review: counts.get(&TaskStatus::Review).copied().unwrap_or(0),
            total: backlog.tasks.len(),
        };
        info!(
            completed = summary.completed,
            failed = summary.failed,
            review = summary.review,
            total = summary.total,
            "Run finished"
        );
        Ok(summary)
    }

    /// Applies one attempt outcome as a status transition. The only place
    /// task state changes during a run.
    async fn apply_outcome(&self, backlog: &mut Backlog, outcome: AttemptOutcome) -> Result<()> {
        let task_id = outcome.task_id.clone();
        let task = backlog
            .get(&task_id)
            .cloned()
            .ok_or_else(|| ConductorError::TaskNotFound(task_id.clone()))?;

        if outcome.cancelled {
            // The attempt never finished; the task stays in_progress with its
            // spec untouched and is requeued by the next run. Only the
            // workspace is cleaned up before exit.
            if let Some(ws) = &outcome.workspace {
                let _ = self.ctx.workspaces.discard(ws).await;
            }
            return Ok(());
        }

        if let Some(e) = &outcome.error {
            warn!(task_id = %task_id, kind = %e.kind(), error = %e, "Attempt errored");
            backlog.record_error(&task_id, e.to_string())?;
        }

        let messy = self.rebase.should_rebase(&task, &outcome.result);

        if outcome.result.success && !messy {
            return self.land(backlog, &task_id, &outcome).await;
        }

        let exhausted = self.rebase.budget_exhausted(&task)
            || task.attempts >= self.ctx.config.scheduler.max_attempts;

        if !exhausted {
            info!(task_id = %task_id, attempt = task.attempts, "Regenerating from improved spec");
            if let Some(ws) = &outcome.workspace {
                let _ = self.ctx.workspaces.discard(ws).await;
            }
            let improved = self.rebase.improve_spec(&task, &outcome.result);
            backlog.transition(&task_id, TaskStatus::Rebasing)?;
            backlog.apply_rebase(improved)?;
            backlog.transition(&task_id, TaskStatus::Ready)?;
            // The improved spec changes the context legitimately.
            self.ctx.drift.forget(&task_id);
            return Ok(());
        }

        if outcome.result.success {
            // Messy but working, and the regeneration budget is spent.
            debug!(task_id = %task_id, "Accepting messy success, budget exhausted");
            return self.land(backlog, &task_id, &outcome).await;
        }

        warn!(task_id = %task_id, attempts = task.attempts, "Task failed, budget exhausted");
        if let Some(ws) = &outcome.workspace {
            let _ = self.ctx.workspaces.discard(ws).await;
        }
        backlog.transition(&task_id, TaskStatus::Failed)?;
        Ok(())
    }

    /// Merges a finished attempt into the base branch. A conflicted merge is
    /// an ambiguity signal, not an error: the branch stays for a human.
    async fn land(
        &self,
        backlog: &mut Backlog,
        task_id: &str,
        outcome: &AttemptOutcome,
    ) -> Result<()> {
        let Some(ws) = &outcome.workspace else {
            backlog.record_error(task_id, "attempt finished without a workspace")?;
            backlog.transition(task_id, TaskStatus::Failed)?;
            return Ok(());
        };

        match self.ctx.workspaces.merge(ws).await {
            Ok(MergeOutcome::Merged) => {
                info!(task_id = %task_id, "Task completed");
                backlog.transition(task_id, TaskStatus::Completed)?;
            }
            Ok(MergeOutcome::Conflicted) => {
                warn!(task_id = %task_id, "Merge conflicted, task parked for review");
                backlog.transition(task_id, TaskStatus::Review)?;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Merge failed");
                backlog.record_error(task_id, e.to_string())?;
                backlog.transition(task_id, TaskStatus::Failed)?;
            }
        }
        Ok(())
    }
}

/// One execution attempt, start to finish. Never touches the backlog; the
/// session is torn down on every path, including cancellation.
async fn execute_attempt<B: AgentBackend>(
    ctx: Arc<WorkerContext<B>>,
    task: Task,
    cancel: CancellationToken,
) -> AttemptOutcome {
    let started = Instant::now();
    let mut workspace = None;

    let run = attempt_inner(&ctx, &task, &cancel, &mut workspace).await;

    match run {
        Ok(result) => AttemptOutcome {
            task_id: task.id,
            workspace,
            result,
            error: None,
            cancelled: false,
        },
        Err(e) => {
            let cancelled = cancel.is_cancelled();
            AttemptOutcome {
                task_id: task.id.clone(),
                workspace,
                result: ExecutionResult {
                    task_id: task.id,
                    attempts: task.attempts,
                    context_bytes: 0,
                    duration: started.elapsed(),
                    commit_count: 0,
                    log: e.to_string(),
                    success: false,
                },
                error: Some(e),
                cancelled,
            }
        }
    }
}

async fn attempt_inner<B: AgentBackend>(
    ctx: &WorkerContext<B>,
    task: &Task,
    cancel: &CancellationToken,
    workspace: &mut Option<Workspace>,
) -> Result<ExecutionResult> {
    let started = Instant::now();

    let ws = ctx.workspaces.acquire(&task.id, task.attempts).await?;
    *workspace = Some(ws.clone());

    // The bundle itself must pass the same gate the transcript will.
    let bundle = ctx.gate.compress(task)?;
    let metrics = ctx
        .gate
        .verify(bundle.payload(), Phase::Implementation, &task.id)?;
    ctx.drift
        .check_drift(&task.id, Phase::Implementation, Checkpoint::Dispatch, &metrics)?;

    let session = ctx.broker.open(Phase::Implementation).await?;

    let driven = tokio::select! {
        _ = cancel.cancelled() => Err(ConductorError::Other(format!(
            "attempt for {} cancelled",
            task.id
        ))),
        out = drive_session(ctx, &session, bundle.payload()) => out,
    };

    // Teardown runs before the result is inspected; an undeleted session
    // outranks whatever the attempt produced.
    let teardown = ctx.broker.close_confirmed(&session).await;
    let output = driven?;
    teardown?;

    // The completion check covers the whole session transcript, bundle
    // included, so a reply mentioning a foreign task id trips the
    // cross-task rule even when it is the only id in the reply.
    let transcript = format!("{}\n{}", bundle.payload(), output);
    let metrics = ctx
        .gate
        .verify(&transcript, Phase::Implementation, &task.id)?;
    ctx.drift
        .check_drift(&task.id, Phase::Implementation, Checkpoint::Completion, &metrics)?;

    let commit_count = ctx.workspaces.commit_count(&ws).await.unwrap_or(0);

    Ok(ExecutionResult {
        task_id: task.id.clone(),
        attempts: task.attempts,
        context_bytes: bundle.byte_len(),
        duration: started.elapsed(),
        commit_count,
        log: output,
        success: true,
    })
}

/// Prompt, poll to idle, read the output. Transient backend failures retry
/// with linear backoff up to the configured budget; everything else is final.
async fn drive_session<B: AgentBackend>(
    ctx: &WorkerContext<B>,
    session: &crate::session::SessionHandle,
    payload: &str,
) -> Result<String> {
    let cfg = &ctx.config.scheduler;
    let mut last_err = None;

    for retry in 0..cfg.backend_retries {
        if retry > 0 {
            tokio::time::sleep(Duration::from_millis(cfg.backend_backoff_ms * retry as u64))
                .await;
        }

        let step = async {
            ctx.broker.backend().prompt(session, payload).await?;
            ctx.broker
                .wait_idle(
                    session,
                    Duration::from_secs(cfg.poll_timeout_secs),
                    Duration::from_millis(cfg.poll_interval_ms),
                )
                .await?;
            ctx.broker.backend().get_last_output(session).await
        };

        match step.await {
            Ok(output) => return Ok(output),
            Err(e) if e.is_retriable() => {
                warn!(session_id = %session.id, retry, error = %e, "Transient backend failure");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| ConductorError::Other("backend retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::MockBackend;

    fn scheduler(dir: &std::path::Path) -> Scheduler<MockBackend> {
        let paths = ProjectPaths::new(dir.to_path_buf());
        let repo = SpecRepository::new(paths.tracks_dir.clone());
        Scheduler::new(
            ConductorConfig::default(),
            paths,
            repo,
            MockBackend::with_output("implemented and verified"),
        )
    }

    fn in_progress_backlog() -> Backlog {
        let mut backlog = Backlog::new("trk-001");
        backlog.push(Task::new("t-001", "Lexer").with_spec("Build the lexer."));
        backlog.refresh_ready();
        backlog.transition("t-001", TaskStatus::InProgress).unwrap();
        backlog.record_attempt("t-001").unwrap();
        backlog
    }

    fn outcome(result: ExecutionResult, error: Option<ConductorError>) -> AttemptOutcome {
        AttemptOutcome {
            task_id: result.task_id.clone(),
            workspace: None,
            result,
            error,
            cancelled: false,
        }
    }

    fn failed_result(attempts: u32) -> ExecutionResult {
        ExecutionResult {
            task_id: "t-001".into(),
            attempts,
            context_bytes: 0,
            duration: Duration::from_secs(1),
            commit_count: 0,
            log: "error: borrow checker rejected the change".into(),
            success: false,
        }
    }

    #[tokio::test]
    async fn failed_attempt_regenerates_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path());
        let mut backlog = in_progress_backlog();

        sched
            .apply_outcome(&mut backlog, outcome(failed_result(1), None))
            .await
            .unwrap();

        let task = backlog.get("t-001").unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert!(task.hints.is_some());
    }

    #[tokio::test]
    async fn exhausted_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path());
        let mut backlog = in_progress_backlog();
        backlog.record_attempt("t-001").unwrap();
        backlog.record_attempt("t-001").unwrap(); // attempts = 3

        sched
            .apply_outcome(&mut backlog, outcome(failed_result(3), None))
            .await
            .unwrap();

        assert_eq!(backlog.get("t-001").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn contamination_error_feeds_regeneration() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path());
        let mut backlog = in_progress_backlog();

        let err = ConductorError::CrossTaskContamination {
            task_id: "t-001".into(),
            others: vec!["t-009".into()],
        };
        sched
            .apply_outcome(&mut backlog, outcome(failed_result(1), Some(err)))
            .await
            .unwrap();

        let task = backlog.get("t-001").unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        // The attempt record is mined into the regenerated spec.
        assert!(task.last_error.as_deref().unwrap().contains("borrow checker"));
    }

    #[tokio::test]
    async fn cancelled_attempt_stays_in_progress_without_spec_change() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(dir.path());
        let mut backlog = in_progress_backlog();
        let spec_before = backlog.get("t-001").unwrap().spec.clone();

        let mut o = outcome(failed_result(1), None);
        o.cancelled = true;
        sched.apply_outcome(&mut backlog, o).await.unwrap();

        let task = backlog.get("t-001").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.spec, spec_before);
        assert!(task.hints.is_none());
    }
}
