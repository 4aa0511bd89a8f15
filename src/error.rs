use thiserror::Error;

/// Coarse error classification reported to the user on abort.
///
/// Retry policy hangs off this: validation and contamination are never
/// retried, instrumentation aborts the run before the loop starts, timeouts
/// and backend failures are retried up to their budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Instrumentation,
    Timeout,
    Contamination,
    Backend,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Instrumentation => "instrumentation",
            Self::Timeout => "timeout",
            Self::Contamination => "contamination",
            Self::Backend => "backend",
            Self::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum ConductorError {
    // Validation: schema/invariant violations, fatal to the current operation.
    #[error("Dependency cycle in backlog: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Task {task_id} references unknown dependency: {dependency}")]
    UnknownDependency { task_id: String, dependency: String },

    #[error("Context bundle for {task_id} is {actual} bytes, budget is {budget}")]
    ContextTooLarge {
        task_id: String,
        actual: usize,
        budget: usize,
    },

    #[error("Task {task_id} has malformed pattern entry: {entry}")]
    InvalidPatternFormat { task_id: String, entry: String },

    #[error("Task {task_id} has {count} {field} entries, limit is {limit}")]
    TooManyHints {
        task_id: String,
        field: &'static str,
        count: usize,
        limit: usize,
    },

    #[error("Backlog schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("Task not found in backlog: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    // Instrumentation: broken verification tooling, fatal to the whole run.
    #[error("Verification tooling is broken: {}", failures.join("; "))]
    InstrumentationBroken { failures: Vec<String> },

    // Contamination: tainted context is worse than no context.
    #[error("Planning debris in {phase} context for {task_id}: {phrase:?}")]
    PlanningDebrisDetected {
        task_id: String,
        phase: String,
        phrase: String,
    },

    #[error("Cross-task contamination for {task_id}: context references {others:?}")]
    CrossTaskContamination {
        task_id: String,
        others: Vec<String>,
    },

    #[error("Full file content embedded in context for {task_id}")]
    FullFileDetected { task_id: String },

    #[error(
        "Context for {task_id} in phase {phase} grew {growth_pct}% over baseline (limit {limit_pct}%)"
    )]
    ExcessiveGrowth {
        task_id: String,
        phase: String,
        growth_pct: u32,
        limit_pct: u32,
    },

    #[error("Session {session_id} still exists after deletion")]
    SessionNotDeleted { session_id: String },

    // Timeouts: retried up to a budget, then surface as task failure.
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    // Backend: external agent failures, retried with backoff.
    #[error("Agent backend error for session {session_id}: {message}")]
    Backend { session_id: String, message: String },

    #[error("Planning role {role} failed: {reason}")]
    PlanningRoleFailed { role: String, reason: String },

    // Infrastructure.
    #[error("Workspace error for {task_id}: {message}")]
    Workspace { task_id: String, message: String },

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Backlog not found: {0}")]
    BacklogNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ConductorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DependencyCycle { .. }
            | Self::UnknownDependency { .. }
            | Self::ContextTooLarge { .. }
            | Self::InvalidPatternFormat { .. }
            | Self::TooManyHints { .. }
            | Self::SchemaVersion { .. }
            | Self::TaskNotFound(_)
            | Self::InvalidTransition { .. }
            | Self::Config(_) => ErrorKind::Validation,

            Self::InstrumentationBroken { .. } => ErrorKind::Instrumentation,

            Self::PlanningDebrisDetected { .. }
            | Self::CrossTaskContamination { .. }
            | Self::FullFileDetected { .. }
            | Self::ExcessiveGrowth { .. }
            | Self::SessionNotDeleted { .. } => ErrorKind::Contamination,

            Self::Timeout { .. } => ErrorKind::Timeout,

            Self::Backend { .. } | Self::PlanningRoleFailed { .. } => ErrorKind::Backend,

            Self::Workspace { .. }
            | Self::Git(_)
            | Self::BacklogNotFound(_)
            | Self::Io(_)
            | Self::Yaml(_)
            | Self::Toml(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the scheduler may retry the failed attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Backend)
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
