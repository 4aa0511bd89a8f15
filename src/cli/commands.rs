use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about = "Task orchestration with context verification", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize conductor in the current project
    Init,

    /// Run the planning phase for a new track
    Plan {
        /// What the track should accomplish
        description: String,
    },

    /// Generate the task backlog from a track's plan
    Generate {
        /// Track ID (e.g. trk-001)
        track_id: String,
    },

    /// Execute a track's backlog to completion
    Run {
        /// Track ID
        track_id: String,
    },

    /// Regenerate a failed task from an improved spec
    Rebase {
        /// Track ID
        track_id: String,

        /// Task ID (e.g. t-003)
        task_id: String,
    },

    /// Show track status
    Status {
        /// Track ID (optional, shows all tracks if not specified)
        track_id: Option<String>,
    },

    /// List all tracks
    List,
}
