pub mod backend;
pub mod backlog;
pub mod cli;
pub mod config;
pub mod context;
pub mod drift;
pub mod error;
pub mod git;
pub mod planning;
pub mod probe;
pub mod rebase;
pub mod repo;
pub mod scheduler;
pub mod session;
pub mod workspace;

pub use backend::CommandBackend;
pub use backlog::{Backlog, ContextHints, ExecutionResult, Task, TaskStatus};
pub use config::{ConductorConfig, ProjectPaths};
pub use context::{ContextBundle, ContextGate, ContextMetrics};
pub use drift::{Checkpoint, DriftMonitor};
pub use error::{ConductorError, ErrorKind, Result};
pub use git::{GitRunner, MergeOutcome};
pub use planning::{backlog_from_plan, merge_documents, PlanningCoordinator, PlanningRole};
pub use probe::{HealthProbe, HealthReport};
pub use rebase::{RebaseEngine, RebaseReason};
pub use repo::SpecRepository;
pub use scheduler::{RunSummary, Scheduler};
pub use session::{AgentBackend, Phase, SessionBroker, SessionHandle, SessionStatus};
pub use workspace::{Workspace, WorkspaceManager};
