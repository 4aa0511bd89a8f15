use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    /// Automatic merge was ambiguous; an external decision is required.
    Review,
    Rebasing,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Review)
    }

    /// Valid targets from this state. The backlog mutator rejects anything else.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Pending => matches!(to, Ready),
            Ready => matches!(to, InProgress),
            InProgress => matches!(to, Completed | Failed | Review | Rebasing),
            Failed => matches!(to, Rebasing),
            Rebasing => matches!(to, Ready),
            Completed | Review => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Review => "review",
            Self::Rebasing => "rebasing",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Review.is_terminal());
        assert!(!TaskStatus::Rebasing.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn rebasing_reenters_ready_only() {
        assert!(TaskStatus::Rebasing.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Rebasing.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Ready));
    }
}
