//! Checkpoint store implementations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::{Checkpoint, CheckpointStore, PipelineRunId, ResearchError};
use tokio::sync::RwLock;

/// Keeps the latest checkpoint of every run in memory.
///
/// Entries are never evicted on their own; long-lived processes call
/// [`InMemoryCheckpointStore::remove`] once a finished run is no longer
/// queried.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<PipelineRunId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the checkpoint of `run_id`, returning it if one was stored.
    pub async fn remove(&self, run_id: PipelineRunId) -> Option<Checkpoint> {
        self.checkpoints.write().await.remove(&run_id)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.run_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: PipelineRunId) -> Result<Option<Checkpoint>, ResearchError> {
        Ok(self.checkpoints.read().await.get(&run_id).cloned())
    }
}

/// Writes one `<run id>.json` file per run into a directory.
///
/// Files are written to a temporary name and renamed into place so a crash
/// mid-write never leaves a truncated checkpoint behind.
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: PipelineRunId) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

fn storage_error(action: &str, path: &Path, e: impl std::fmt::Display) -> ResearchError {
    ResearchError::Checkpoint {
        message: format!("failed to {action} {}: {e}", path.display()),
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error("create", &self.dir, e))?;

        let path = self.path_for(checkpoint.run_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint).map_err(|e| storage_error("serialise", &path, e))?;
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| storage_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_error("replace", &path, e))
    }

    async fn load(&self, run_id: PipelineRunId) -> Result<Option<Checkpoint>, ResearchError> {
        let path = self.path_for(run_id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error("read", &path, e)),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| storage_error("parse", &path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{PipelineState, ResearchQuery, RunStatus, StageName, Timestamp};
    use pretty_assertions::assert_eq;

    fn checkpoint(run_id: PipelineRunId, status: RunStatus) -> Checkpoint {
        let query = ResearchQuery::builder("What misconceptions persist about inertia?")
            .build()
            .unwrap();
        Checkpoint {
            run_id,
            status,
            state: PipelineState::new(query),
            next_stage: Some(StageName::from_static("document_analysis")),
            outcomes: Vec::new(),
            updated_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_keeps_latest_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let id = PipelineRunId::new_random();
        store.save(&checkpoint(id, RunStatus::Pending)).await.unwrap();
        store.save(&checkpoint(id, RunStatus::Completed)).await.unwrap();
        assert_eq!(store.load(id).await.unwrap().unwrap().status, RunStatus::Completed);
        assert!(store.load(PipelineRunId::new_random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store_releases_removed_runs() {
        let store = InMemoryCheckpointStore::new();
        let done = PipelineRunId::new_random();
        let live = PipelineRunId::new_random();
        store.save(&checkpoint(done, RunStatus::Completed)).await.unwrap();
        store.save(&checkpoint(live, RunStatus::Pending)).await.unwrap();

        let removed = store.remove(done).await.unwrap();
        assert_eq!(removed.run_id, done);
        assert!(store.load(done).await.unwrap().is_none());
        assert!(store.remove(done).await.is_none());
        assert!(store.load(live).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::new(dir.path().join("checkpoints"));
        let id = PipelineRunId::new_random();
        let saved = checkpoint(
            id,
            RunStatus::Running {
                stage: StageName::from_static("literature_search"),
            },
        );
        store.save(&saved).await.unwrap();

        let reopened = JsonFileCheckpointStore::new(dir.path().join("checkpoints"));
        assert_eq!(reopened.load(id).await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn test_file_store_reports_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::new(dir.path());
        let id = PipelineRunId::new_random();
        std::fs::write(dir.path().join(format!("{id}.json")), b"{ not json").unwrap();
        let err = store.load(id).await.unwrap_err();
        assert!(matches!(err, ResearchError::Checkpoint { .. }));
    }
}
