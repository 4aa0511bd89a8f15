use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conductor::backend::CommandBackend;
use conductor::backlog::{ExecutionResult, TaskStatus};
use conductor::cli::{Cli, Commands, Display};
use conductor::config::{ConductorConfig, ProjectPaths};
use conductor::error::{ConductorError, Result};
use conductor::planning::{backlog_from_plan, PlanningCoordinator};
use conductor::rebase::RebaseEngine;
use conductor::repo::SpecRepository;
use conductor::scheduler::Scheduler;
use conductor::session::SessionBroker;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&format!("[{}] {}", e.kind(), e));
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("conductor=debug")
    } else {
        EnvFilter::new("conductor=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();

    match cli.command {
        Commands::Init => cmd_init(&display).await,
        Commands::Plan { description } => cmd_plan(&display, &description).await,
        Commands::Generate { track_id } => cmd_generate(&display, &track_id).await,
        Commands::Run { track_id } => cmd_run(&display, &track_id).await,
        Commands::Rebase { track_id, task_id } => cmd_rebase(&display, &track_id, &task_id).await,
        Commands::Status { track_id } => cmd_status(&display, track_id).await,
        Commands::List => cmd_list(&display).await,
    }
}

fn find_project_root() -> Result<PathBuf> {
    let current = std::env::current_dir()?;

    let mut path = current.as_path();
    loop {
        if path.join(".git").exists() {
            return Ok(path.to_path_buf());
        }
        path = path
            .parent()
            .ok_or_else(|| ConductorError::Other("not inside a git repository".into()))?;
    }
}

async fn load_project() -> Result<(ProjectPaths, ConductorConfig)> {
    let root = find_project_root()?;
    let paths = ProjectPaths::new(root);
    if !paths.state_dir.exists() {
        return Err(ConductorError::Other(
            "conductor is not initialized here, run `conductor init` first".into(),
        ));
    }
    let config = ConductorConfig::load(&paths.state_dir).await?;
    Ok((paths, config))
}

async fn cmd_init(display: &Display) -> Result<()> {
    let root = find_project_root()?;
    let paths = ProjectPaths::new(root);

    if paths.state_dir.exists() {
        display.print_warning("conductor is already initialized in this project.");
        return Ok(());
    }

    paths.ensure_dirs().await?;
    let config = ConductorConfig::default();
    config.save(&paths.state_dir).await?;

    display.print_success("Initialized conductor.");
    display.print_info(&format!(
        "Configuration: {}",
        paths.state_dir.join("config.toml").display()
    ));
    display.print_info(&format!("Tracks: {}", paths.tracks_dir.display()));
    Ok(())
}

async fn cmd_plan(display: &Display, description: &str) -> Result<()> {
    let (paths, config) = load_project().await?;
    let repo = SpecRepository::new(paths.tracks_dir.clone());
    repo.init().await?;

    let backend = CommandBackend::new(config.backend.clone(), paths.state_dir.join("sessions"));
    let broker = SessionBroker::new(backend);
    let coordinator = PlanningCoordinator::new(&broker, config.planning.clone());

    display.print_info("Running planning roles...");
    let plan = coordinator.run_planning(description).await?;

    let track_id = repo.next_track_id().await?;
    repo.save_plan(&track_id, &plan).await?;

    display.print_success(&format!("Plan saved for track {}", track_id));
    display.print_info(&format!(
        "Next: conductor generate {} to build the backlog",
        track_id
    ));
    Ok(())
}

async fn cmd_generate(display: &Display, track_id: &str) -> Result<()> {
    let (paths, config) = load_project().await?;
    let repo = SpecRepository::new(paths.tracks_dir.clone());
    repo.init().await?;

    let plan = repo.load_plan(track_id).await?;
    let backlog = backlog_from_plan(
        track_id,
        &plan,
        &config.context,
        config.planning.default_task_estimate_secs,
    )?;
    repo.save_backlog(&backlog).await?;

    display.print_success(&format!(
        "Generated backlog with {} tasks for {}",
        backlog.tasks.len(),
        track_id
    ));
    Ok(())
}

async fn cmd_run(display: &Display, track_id: &str) -> Result<()> {
    let (paths, config) = load_project().await?;
    let repo = SpecRepository::new(paths.tracks_dir.clone());
    repo.init().await?;

    let backend = CommandBackend::new(config.backend.clone(), paths.state_dir.join("sessions"));
    let scheduler = Scheduler::new(config, paths, repo, backend);

    let cancel = scheduler.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    display.print_info(&format!("Running track {}", track_id));
    let summary = scheduler.run(track_id).await?;
    display.print_run_summary(&summary);

    if summary.failed == 0 && summary.review == 0 {
        display.print_success("All tasks completed.");
    } else if summary.review > 0 {
        display.print_warning("Some tasks are parked for review; their branches were kept.");
    }
    Ok(())
}

async fn cmd_rebase(display: &Display, track_id: &str, task_id: &str) -> Result<()> {
    let (paths, config) = load_project().await?;
    let repo = SpecRepository::new(paths.tracks_dir.clone());
    repo.init().await?;

    let mut backlog = repo.load_backlog(track_id).await?;
    let task = backlog
        .get(task_id)
        .cloned()
        .ok_or_else(|| ConductorError::TaskNotFound(task_id.to_string()))?;

    let engine = RebaseEngine::new(
        config.rebase.clone(),
        config.context.clone(),
        config.planning.default_task_estimate_secs,
    );
    let record = ExecutionResult {
        task_id: task.id.clone(),
        attempts: task.attempts,
        context_bytes: 0,
        duration: Duration::ZERO,
        commit_count: 0,
        log: task.last_error.clone().unwrap_or_default(),
        success: false,
    };
    let improved = engine.improve_spec(&task, &record);

    backlog.transition(task_id, TaskStatus::Rebasing)?;
    backlog.apply_rebase(improved)?;
    backlog.transition(task_id, TaskStatus::Ready)?;
    repo.save_backlog(&backlog).await?;

    display.print_success(&format!(
        "Task {} rebased and queued; run `conductor run {}` to execute it",
        task_id, track_id
    ));
    Ok(())
}

async fn cmd_status(display: &Display, track_id: Option<String>) -> Result<()> {
    let (paths, _config) = load_project().await?;
    let repo = SpecRepository::new(paths.tracks_dir.clone());
    repo.init().await?;

    match track_id {
        Some(id) => {
            let backlog = repo.load_backlog(&id).await?;
            display.print_backlog_detail(&backlog);
        }
        None => cmd_list(display).await?,
    }
    Ok(())
}

async fn cmd_list(display: &Display) -> Result<()> {
    let (paths, _config) = load_project().await?;
    let repo = SpecRepository::new(paths.tracks_dir.clone());
    repo.init().await?;

    let mut rows = Vec::new();
    for track_id in repo.list_tracks().await? {
        let backlog = repo.load_backlog(&track_id).await.ok();
        rows.push((track_id, backlog));
    }
    display.print_tracks_table(&rows);
    Ok(())
}
