//! Durable, versioned storage for plans and backlogs.
//!
//! Specs are primary; generated artifacts are disposable. Every write is
//! whole-file, atomic (tmp + fsync + rename), and idempotent, so the backlog
//! can be written back after every status mutation without partial states.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use crate::backlog::Backlog;
use crate::error::{ConductorError, Result};

pub struct SpecRepository {
    tracks_dir: PathBuf,
}

impl SpecRepository {
    pub fn new(tracks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tracks_dir: tracks_dir.into(),
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.tracks_dir).await?;
        self.recover_interrupted_writes().await;
        Ok(())
    }

    pub async fn save_backlog(&self, backlog: &Backlog) -> Result<()> {
        let dir = self.track_dir(&backlog.track_id);
        fs::create_dir_all(&dir).await?;
        let content = serde_yaml_bw::to_string(backlog)?;
        self.write_atomic(&dir.join("backlog.yaml"), &content).await
    }

    pub async fn load_backlog(&self, track_id: &str) -> Result<Backlog> {
        let path = self.track_dir(track_id).join("backlog.yaml");
        if !path.exists() {
            return Err(ConductorError::BacklogNotFound(track_id.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        let backlog: Backlog = serde_yaml_bw::from_str(&content)?;
        Ok(backlog)
    }

    pub async fn save_plan(&self, track_id: &str, plan: &str) -> Result<()> {
        let dir = self.track_dir(track_id);
        fs::create_dir_all(&dir).await?;
        self.write_atomic(&dir.join("plan.md"), plan).await?;
        info!(track_id = %track_id, "Saved plan document");
        Ok(())
    }

    pub async fn load_plan(&self, track_id: &str) -> Result<String> {
        let path = self.track_dir(track_id).join("plan.md");
        if !path.exists() {
            return Err(ConductorError::BacklogNotFound(format!(
                "{} (no plan.md)",
                track_id
            )));
        }
        Ok(fs::read_to_string(&path).await?)
    }

    pub async fn list_tracks(&self) -> Result<Vec<String>> {
        let mut tracks = Vec::new();
        if !self.tracks_dir.exists() {
            return Ok(tracks);
        }
        let mut entries = fs::read_dir(&self.tracks_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tracks.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        tracks.sort();
        Ok(tracks)
    }

    pub async fn next_track_id(&self) -> Result<String> {
        let tracks = self.list_tracks().await?;
        let max_num = tracks
            .iter()
            .filter_map(|t| t.strip_prefix("trk-").and_then(|s| s.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        Ok(format!("trk-{:03}", max_num + 1))
    }

    fn track_dir(&self, track_id: &str) -> PathBuf {
        self.tracks_dir.join(track_id)
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, content).await?;

        // fsync off the async runtime.
        let tmp_clone = tmp_path.clone();
        let sync_result = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&tmp_clone).and_then(|file| file.sync_all())
        })
        .await;
        match sync_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to sync temp file to disk"),
            Err(e) => tracing::warn!(error = %e, "Sync task failed"),
        }

        // POSIX rename is atomic.
        fs::rename(&tmp_path, path).await?;

        debug!(path = %path.display(), "Atomic write completed");
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        let Ok(mut tracks) = fs::read_dir(&self.tracks_dir).await else {
            return;
        };
        while let Ok(Some(track)) = tracks.next_entry().await {
            let Ok(mut files) = fs::read_dir(track.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = files.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{ContextHints, Task};

    fn sample_backlog() -> Backlog {
        let mut backlog = Backlog::new("trk-001");
        backlog.push(
            Task::new("t-001", "First")
                .with_spec("Do the first thing.")
                .with_acceptance(vec!["it works".into()]),
        );
        backlog.push(
            Task::new("t-002", "Second")
                .with_dependencies(vec!["t-001".into()])
                .with_hints(ContextHints {
                    constraints: vec!["no new deps".into()],
                    patterns: vec!["src/a.rs:1-10 - setup".into()],
                    gotchas: vec![],
                }),
        );
        backlog
    }

    #[tokio::test]
    async fn backlog_round_trips_losslessly() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SpecRepository::new(dir.path());
        repo.init().await.unwrap();

        let backlog = sample_backlog();
        repo.save_backlog(&backlog).await.unwrap();
        let loaded = repo.load_backlog("trk-001").await.unwrap();

        assert_eq!(backlog, loaded);

        // Save-load again: still identical.
        repo.save_backlog(&loaded).await.unwrap();
        assert_eq!(repo.load_backlog("trk-001").await.unwrap(), loaded);
    }

    #[tokio::test]
    async fn missing_backlog_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SpecRepository::new(dir.path());
        repo.init().await.unwrap();

        let err = repo.load_backlog("trk-404").await.unwrap_err();
        assert!(matches!(err, ConductorError::BacklogNotFound(_)));
    }

    #[tokio::test]
    async fn track_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SpecRepository::new(dir.path());
        repo.init().await.unwrap();

        assert_eq!(repo.next_track_id().await.unwrap(), "trk-001");
        repo.save_backlog(&Backlog::new("trk-001")).await.unwrap();
        repo.save_backlog(&Backlog::new("trk-007")).await.unwrap();
        assert_eq!(repo.next_track_id().await.unwrap(), "trk-008");
    }

    #[tokio::test]
    async fn interrupted_writes_are_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let track_dir = dir.path().join("trk-001");
        std::fs::create_dir_all(&track_dir).unwrap();
        std::fs::write(track_dir.join("backlog.tmp"), "half a write").unwrap();

        let repo = SpecRepository::new(dir.path());
        repo.init().await.unwrap();

        assert!(!track_dir.join("backlog.tmp").exists());
    }
}
