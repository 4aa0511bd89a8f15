//! Ephemeral sessions against the external agent backend.
//!
//! A session is a resource with an observable lifecycle: created, active,
//! deletion-requested, confirmed-absent. Confirmed-absent is a required
//! terminal state; an undeleted session is a latent contamination source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ConductorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Implementation,
    Review,
    Rebase,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Implementation => "implementation",
            Self::Review => "review",
            Self::Rebase => "rebase",
        };
        write!(f, "{}", s)
    }
}

/// Opaque handle to one backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub phase: Phase,
    pub disposable: bool,
}

/// Terminal/observable backend session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Idle,
    Error,
}

/// The only capabilities assumed of the external agent backend.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn create_session(&self, phase: Phase) -> Result<SessionHandle>;
    async fn prompt(&self, handle: &SessionHandle, text: &str) -> Result<()>;
    async fn get_status(&self, handle: &SessionHandle) -> Result<SessionStatus>;
    async fn get_last_output(&self, handle: &SessionHandle) -> Result<String>;
    async fn delete_session(&self, handle: &SessionHandle) -> Result<()>;
    async fn exists(&self, handle: &SessionHandle) -> Result<bool>;
}

/// Owns session lifecycles end to end. Components never call the backend's
/// create/delete directly; they go through the broker so teardown is always
/// reconfirmed.
pub struct SessionBroker<B: AgentBackend> {
    backend: B,
}

impl<B: AgentBackend> SessionBroker<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn open(&self, phase: Phase) -> Result<SessionHandle> {
        let handle = self.backend.create_session(phase).await?;
        debug!(session_id = %handle.id, phase = %phase, "Opened session");
        Ok(handle)
    }

    /// Deletes the session and re-checks existence. The backend still
    /// reporting the session is fatal, never downgraded to a warning.
    pub async fn close_confirmed(&self, handle: &SessionHandle) -> Result<()> {
        self.backend.delete_session(handle).await?;

        if self.backend.exists(handle).await? {
            warn!(session_id = %handle.id, "Session survived deletion");
            return Err(ConductorError::SessionNotDeleted {
                session_id: handle.id.clone(),
            });
        }

        debug!(session_id = %handle.id, "Session teardown confirmed");
        Ok(())
    }

    /// Polls the session to a terminal state. A timeout is an error, never an
    /// indefinite hang; a backend-reported error state surfaces as such.
    pub async fn wait_idle(
        &self,
        handle: &SessionHandle,
        timeout: std::time::Duration,
        interval: std::time::Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.backend.get_status(handle).await? {
                SessionStatus::Idle => return Ok(()),
                SessionStatus::Error => {
                    return Err(ConductorError::Backend {
                        session_id: handle.id.clone(),
                        message: "session entered error state".into(),
                    });
                }
                SessionStatus::Running => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConductorError::Timeout {
                    operation: format!("polling session {}", handle.id),
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Correlation id for sessions created by backends that have no native id.
pub fn new_session_id(phase: Phase) -> String {
    format!("{}-{}", phase, Uuid::new_v4())
}
