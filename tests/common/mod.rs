//! Shared fixtures: a scripted in-memory agent backend and a throwaway git
//! repository for workspace tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use conductor::error::Result;
use conductor::session::{AgentBackend, Phase, SessionHandle, SessionStatus};

#[derive(Default)]
pub struct ScriptedState {
    pub sessions: HashMap<String, Phase>,
    pub prompts: Vec<(String, String)>,
    /// Prompt last sent to each session, used to script per-role replies.
    pub last_prompt: HashMap<String, String>,
    /// When set, exists() keeps reporting true after deletion.
    pub sticky_sessions: bool,
}

/// Backend whose reply is computed from the prompt it received. The default
/// reply function echoes a fixed clean string.
#[derive(Clone)]
pub struct ScriptedBackend {
    pub state: Arc<Mutex<ScriptedState>>,
    pub calls: Arc<AtomicUsize>,
    reply: Arc<dyn Fn(&str) -> String + Send + Sync>,
    counter: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn with_output(output: &str) -> Self {
        let canned = output.to_string();
        Self::with_reply(move |_| canned.clone())
    }

    pub fn with_reply(reply: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptedState::default())),
            calls: Arc::new(AtomicUsize::new(0)),
            reply: Arc::new(reply),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn create_session(&self, phase: Phase) -> Result<SessionHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", phase, n);
        self.state.lock().sessions.insert(id.clone(), phase);
        Ok(SessionHandle {
            id,
            phase,
            disposable: true,
        })
    }

    async fn prompt(&self, handle: &SessionHandle, text: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.prompts.push((handle.id.clone(), text.to_string()));
        state.last_prompt.insert(handle.id.clone(), text.to_string());
        Ok(())
    }

    async fn get_status(&self, _handle: &SessionHandle) -> Result<SessionStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SessionStatus::Idle)
    }

    async fn get_last_output(&self, handle: &SessionHandle) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = self
            .state
            .lock()
            .last_prompt
            .get(&handle.id)
            .cloned()
            .unwrap_or_default();
        Ok((self.reply)(&prompt))
    }

    async fn delete_session(&self, handle: &SessionHandle) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if !state.sticky_sessions {
            state.sessions.remove(&handle.id);
        }
        Ok(())
    }

    async fn exists(&self, handle: &SessionHandle) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().sessions.contains_key(&handle.id))
    }
}

/// Initializes a git repository with one commit on `main`.
pub fn init_git_repo(root: &Path) {
    run_git(root, &["init", "-b", "main"]);
    run_git(root, &["config", "user.email", "tests@example.com"]);
    run_git(root, &["config", "user.name", "Tests"]);
    std::fs::write(root.join("README.md"), "fixture\n").unwrap();
    run_git(root, &["add", "-A"]);
    run_git(root, &["commit", "-m", "initial"]);
}

fn run_git(root: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .unwrap_or_else(|e| panic!("git {:?} did not spawn: {e}", args));
    assert!(status.success(), "git {:?} failed", args);
}
