//! Default agent backend: one external process per prompt.
//!
//! Session state is a directory under `.conductor/sessions/`; existence of
//! the directory is the existence of the session, so the broker's deletion
//! reconfirmation is a real filesystem check, not a bookkeeping echo.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::error::{ConductorError, Result};
use crate::session::{new_session_id, AgentBackend, Phase, SessionHandle, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Error,
}

#[derive(Clone)]
pub struct CommandBackend {
    config: BackendConfig,
    sessions_dir: PathBuf,
    states: Arc<Mutex<HashMap<String, RunState>>>,
}

impl CommandBackend {
    pub fn new(config: BackendConfig, sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            sessions_dir: sessions_dir.into(),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn session_dir(&self, handle: &SessionHandle) -> PathBuf {
        self.sessions_dir.join(&handle.id)
    }
}

#[async_trait]
impl AgentBackend for CommandBackend {
    async fn create_session(&self, phase: Phase) -> Result<SessionHandle> {
        let handle = SessionHandle {
            id: new_session_id(phase),
            phase,
            disposable: true,
        };
        fs::create_dir_all(self.session_dir(&handle)).await?;
        self.states.lock().insert(handle.id.clone(), RunState::Idle);
        debug!(session_id = %handle.id, "Created command session");
        Ok(handle)
    }

    async fn prompt(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        let dir = self.session_dir(handle);
        if !dir.exists() {
            return Err(ConductorError::Backend {
                session_id: handle.id.clone(),
                message: "session directory does not exist".into(),
            });
        }

        let prompt_file = dir.join("prompt.md");
        fs::write(&prompt_file, text).await?;
        self.states
            .lock()
            .insert(handle.id.clone(), RunState::Running);

        let cmd = self.config.agent_cmd.clone();
        let states = Arc::clone(&self.states);
        let session_id = handle.id.clone();
        tokio::spawn(async move {
            let output = Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .current_dir(&dir)
                .env("CONDUCTOR_PROMPT_FILE", &prompt_file)
                .env("CONDUCTOR_SESSION_DIR", &dir)
                .output()
                .await;

            let state = match output {
                Ok(out) if out.status.success() => {
                    let _ = fs::write(dir.join("last_output.md"), &out.stdout).await;
                    RunState::Idle
                }
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    warn!(session_id = %session_id, stderr = %stderr, "Agent command failed");
                    let _ = fs::write(dir.join("last_output.md"), &out.stderr).await;
                    RunState::Error
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Agent command did not spawn");
                    RunState::Error
                }
            };
            states.lock().insert(session_id, state);
        });

        Ok(())
    }

    async fn get_status(&self, handle: &SessionHandle) -> Result<SessionStatus> {
        match self.states.lock().get(&handle.id) {
            Some(RunState::Idle) => Ok(SessionStatus::Idle),
            Some(RunState::Running) => Ok(SessionStatus::Running),
            Some(RunState::Error) => Ok(SessionStatus::Error),
            None => Err(ConductorError::Backend {
                session_id: handle.id.clone(),
                message: "unknown session".into(),
            }),
        }
    }

    async fn get_last_output(&self, handle: &SessionHandle) -> Result<String> {
        let path = self.session_dir(handle).join("last_output.md");
        if !path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(&path).await?)
    }

    async fn delete_session(&self, handle: &SessionHandle) -> Result<()> {
        let dir = self.session_dir(handle);
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        self.states.lock().remove(&handle.id);
        debug!(session_id = %handle.id, "Deleted command session");
        Ok(())
    }

    async fn exists(&self, handle: &SessionHandle) -> Result<bool> {
        Ok(self.session_dir(handle).exists())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::SessionBroker;

    fn backend(dir: &std::path::Path) -> CommandBackend {
        CommandBackend::new(BackendConfig::default(), dir.join("sessions"))
    }

    #[tokio::test]
    async fn echo_agent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let broker = SessionBroker::new(backend);

        let handle = broker.open(Phase::Implementation).await.unwrap();
        broker
            .backend()
            .prompt(&handle, "# Task t-001: do the thing")
            .await
            .unwrap();
        broker
            .wait_idle(
                &handle,
                Duration::from_secs(10),
                Duration::from_millis(20),
            )
            .await
            .unwrap();

        let output = broker.backend().get_last_output(&handle).await.unwrap();
        assert!(output.contains("t-001"));

        broker.close_confirmed(&handle).await.unwrap();
        assert!(!broker.backend().exists(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn failing_agent_reports_error_state() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(
            BackendConfig {
                agent_cmd: "false".into(),
            },
            dir.path().join("sessions"),
        );
        let broker = SessionBroker::new(backend);

        let handle = broker.open(Phase::Implementation).await.unwrap();
        broker.backend().prompt(&handle, "anything").await.unwrap();

        let err = broker
            .wait_idle(&handle, Duration::from_secs(10), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Backend { .. }));
    }

    #[tokio::test]
    async fn prompt_to_deleted_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let handle = backend.create_session(Phase::Planning).await.unwrap();
        backend.delete_session(&handle).await.unwrap();

        let err = backend.prompt(&handle, "late prompt").await.unwrap_err();
        assert!(matches!(err, ConductorError::Backend { .. }));
    }
}
