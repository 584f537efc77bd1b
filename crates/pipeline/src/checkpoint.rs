//! Run checkpoints and the store port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{PipelineRunId, PipelineState, ResearchError, RunStatus, StageName, StageOutcome, Timestamp};

/// Snapshot of a run, saved after every stage commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: PipelineRunId,
    pub status: RunStatus,
    pub state: PipelineState,
    /// Stage a resumed run starts with; `None` when nothing is left to run.
    pub next_stage: Option<StageName>,
    pub outcomes: Vec<StageOutcome>,
    pub updated_at: Timestamp,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Saves `checkpoint`, replacing any earlier checkpoint of the same run.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError>;

    /// Loads the latest checkpoint of `run_id`, if one exists.
    async fn load(&self, run_id: PipelineRunId) -> Result<Option<Checkpoint>, ResearchError>;
}
