mod settings;

pub use settings::{
    BackendConfig, ConductorConfig, ContextConfig, DriftConfig, PlanningConfig, ProjectPaths,
    RebaseConfig, SchedulerConfig, ToolingConfig, WorkspaceConfig,
};
