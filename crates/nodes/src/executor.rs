//! The pipeline engine.
//!
//! [`PipelineExecutor`] owns the ordered stage list and drives one
//! [`PipelineState`] through it. It is the only code that mutates the state:
//! stages hand back a [`StageCommit`] and the executor applies it. Every stage
//! invocation is bounded by a timeout, raced against the run's cancellation
//! signal and shielded from panics, so a run always ends with a complete state
//! and an error/warning log. A checkpoint is written after every stage commit,
//! which is what makes [`PipelineExecutor::status`] and
//! [`PipelineExecutor::resume`] possible.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use pipeline::{
    Checkpoint, CheckpointStore, EngineSettings, FailurePolicy, LogEntry, PipelineRunId,
    PipelineState, Precondition, ResearchError, ResearchQuery, RunStatus, Stage, StageCommit,
    StageContext, StageFailure, StageName, StageOutcome, StageStatus, Timestamp,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The one optional loop of the otherwise linear pipeline: when the gate
/// stage's quality assessment is below the minimum, execution jumps back to
/// `restart_from`.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionLoop {
    pub gate_stage: StageName,
    pub restart_from: StageName,
    pub max_reworks: u32,
    pub min_quality_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub stage_timeout: Duration,
    pub run_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub revision: Option<RevisionLoop>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for ExecutorSettings {
    fn from(engine: &EngineSettings) -> Self {
        let revision = (engine.max_reworks > 0).then(|| RevisionLoop {
            gate_stage: StageName::from_static(pipeline::stage::names::QUALITY_CONTROL),
            restart_from: StageName::from_static(pipeline::stage::names::CONTENT_SYNTHESIS),
            max_reworks: engine.max_reworks,
            min_quality_score: engine.min_quality_score,
        });
        Self {
            stage_timeout: engine.stage_timeout(),
            run_timeout: engine.run_timeout(),
            failure_policy: engine.failure_policy,
            revision,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Final state of a run plus its status and per-stage outcomes.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: PipelineRunId,
    pub state: PipelineState,
    pub status: RunStatus,
    pub outcomes: Vec<StageOutcome>,
}

impl RunOutcome {
    /// Run-level error: the abort reason, or `None` when the run completed.
    pub fn run_error(&self) -> Option<String> {
        match &self.status {
            RunStatus::Aborted { stage: Some(stage), reason } => {
                Some(format!("run aborted at stage '{stage}': {reason}"))
            }
            RunStatus::Aborted { stage: None, reason } => Some(format!("run aborted: {reason}")),
            _ => None,
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatusReport {
    pub run_id: PipelineRunId,
    pub status: RunStatus,
    pub current_stage: Option<StageName>,
    pub errors: Vec<LogEntry>,
    pub complete: bool,
    pub outcomes: Vec<StageOutcome>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct PipelineExecutor {
    stages: Vec<Arc<dyn Stage>>,
    settings: ExecutorSettings,
    checkpoints: Arc<dyn CheckpointStore>,
}

/// What the stage loop does after one stage.
enum Step {
    Next(usize),
    /// `stage_failed` marks an untolerated stage failure (policy halt), which
    /// passes through `StageFailed` before `Aborted`.
    Abort {
        stage: Option<StageName>,
        reason: String,
        stage_failed: bool,
    },
}

impl PipelineExecutor {
    /// Creates an executor over `stages`, run in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`ResearchError::Configuration`] when the stage list is empty,
    /// contains duplicate names, or the revision loop names stages that are
    /// missing or out of order.
    pub fn new(
        stages: Vec<Arc<dyn Stage>>,
        settings: ExecutorSettings,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, ResearchError> {
        let config_error = |message: String| ResearchError::Configuration { message };

        if stages.is_empty() {
            return Err(config_error("pipeline has no stages".into()));
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name().clone()) {
                return Err(config_error(format!("duplicate stage name '{}'", stage.name())));
            }
        }

        let executor = Self {
            stages,
            settings,
            checkpoints,
        };
        if let Some(revision) = &executor.settings.revision {
            let gate = executor.index_of(&revision.gate_stage);
            let restart = executor.index_of(&revision.restart_from);
            match (gate, restart) {
                (Some(g), Some(r)) if r <= g => {}
                _ => {
                    return Err(config_error(format!(
                        "revision loop '{}' -> '{}' does not match the stage order",
                        revision.gate_stage, revision.restart_from
                    )))
                }
            }
        }
        Ok(executor)
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name().clone()).collect()
    }

    /// Runs every stage against `state`.
    ///
    /// # Errors
    ///
    /// Only setup faults escape: [`ResearchError::InvalidQuery`] when the
    /// state's query is malformed. Everything else ends up in the returned
    /// state's logs.
    pub async fn run(&self, state: PipelineState) -> Result<RunOutcome, ResearchError> {
        self.run_with_cancellation(state, CancellationToken::new()).await
    }

    /// Convenience wrapper building the initial state from `query`.
    pub async fn run_query(&self, query: ResearchQuery) -> Result<RunOutcome, ResearchError> {
        self.run(PipelineState::new(query)).await
    }

    /// Like [`Self::run`], aborting when `cancel` fires.
    pub async fn run_with_cancellation(
        &self,
        state: PipelineState,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ResearchError> {
        self.run_as(PipelineRunId::new_random(), state, cancel).await
    }

    /// Runs under a caller-chosen identifier, so the caller can query
    /// [`Self::status`] while the run is in flight.
    pub async fn run_as(
        &self,
        run_id: PipelineRunId,
        state: PipelineState,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ResearchError> {
        state.query.validate()?;
        self.save(run_id, RunStatus::Pending, &state, Some(0), &[]).await;
        self.drive(run_id, state, 0, Vec::new(), cancel).await
    }

    /// Continues a run from its latest checkpoint.
    ///
    /// The stage recorded as next in the checkpoint runs again from the
    /// committed state, which is safe because stages replace their own
    /// output. A run that already reached a terminal state is returned as is.
    ///
    /// # Errors
    ///
    /// [`ResearchError::UnknownRun`] when no checkpoint exists,
    /// [`ResearchError::Checkpoint`] when it cannot be read.
    pub async fn resume(
        &self,
        run_id: PipelineRunId,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ResearchError> {
        let checkpoint = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or(ResearchError::UnknownRun { run_id })?;

        if checkpoint.status.is_terminal() {
            return Ok(RunOutcome {
                run_id,
                state: checkpoint.state,
                status: checkpoint.status,
                outcomes: checkpoint.outcomes,
            });
        }

        checkpoint.state.query.validate()?;
        let start = match &checkpoint.next_stage {
            Some(name) => self.index_of(name).ok_or_else(|| ResearchError::Configuration {
                message: format!("checkpointed stage '{name}' is not part of this pipeline"),
            })?,
            None => self.stages.len(),
        };
        info!(run_id = %run_id, start_stage = start, "Resuming pipeline run");
        self.drive(run_id, checkpoint.state, start, checkpoint.outcomes, cancel)
            .await
    }

    /// Reports the latest checkpointed status of a run.
    ///
    /// # Errors
    ///
    /// [`ResearchError::UnknownRun`] when no checkpoint exists.
    pub async fn status(&self, run_id: PipelineRunId) -> Result<RunStatusReport, ResearchError> {
        let checkpoint = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or(ResearchError::UnknownRun { run_id })?;
        Ok(RunStatusReport {
            run_id,
            complete: checkpoint.status.is_terminal(),
            status: checkpoint.status,
            current_stage: checkpoint.state.current_stage.clone(),
            errors: checkpoint.state.errors,
            outcomes: checkpoint.outcomes,
        })
    }

    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        run_id: PipelineRunId,
        mut state: PipelineState,
        start: usize,
        mut outcomes: Vec<StageOutcome>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ResearchError> {
        let span = info_span!("pipeline_run", run_id = %run_id, session = %state.query.session_id);
        async move {
            let deadline = Instant::now() + self.settings.run_timeout;
            let mut index = start;
            self.save(run_id, self.running_status(index), &state, Some(index), &outcomes)
                .await;

            let status = loop {
                let Some(stage) = self.stages.get(index) else {
                    break RunStatus::Completed;
                };
                match self
                    .run_stage(run_id, index, stage.as_ref(), &mut state, &mut outcomes, deadline, &cancel)
                    .await
                {
                    Step::Next(next) => {
                        index = next;
                        self.save(run_id, self.running_status(index), &state, Some(index), &outcomes)
                            .await;
                    }
                    Step::Abort {
                        stage,
                        reason,
                        stage_failed,
                    } => {
                        if let (true, Some(name)) = (stage_failed, &stage) {
                            self.save(
                                run_id,
                                RunStatus::StageFailed { stage: name.clone() },
                                &state,
                                Some(index),
                                &outcomes,
                            )
                            .await;
                        }
                        state.record_error(stage.as_ref(), format!("run aborted: {reason}"));
                        error!(stage = ?stage.as_ref().map(StageName::as_str), reason = %reason, "Pipeline run aborted");
                        break RunStatus::Aborted { stage, reason };
                    }
                }
            };

            if status == RunStatus::Completed {
                state.current_stage = None;
                info!(
                    documents = state.papers.len(),
                    errors = state.errors.len(),
                    warnings = state.warnings.len(),
                    "Pipeline run completed"
                );
            }
            let next = (status != RunStatus::Completed).then_some(index);
            self.save(run_id, status.clone(), &state, next, &outcomes).await;

            Ok(RunOutcome {
                run_id,
                state,
                status,
                outcomes,
            })
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        run_id: PipelineRunId,
        index: usize,
        stage: &dyn Stage,
        state: &mut PipelineState,
        outcomes: &mut Vec<StageOutcome>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Step {
        let name = stage.name().clone();
        let halt = self.settings.failure_policy == FailurePolicy::Halt;

        if cancel.is_cancelled() {
            return Step::Abort {
                stage: Some(name),
                reason: "cancelled".into(),
                stage_failed: false,
            };
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Step::Abort {
                stage: Some(name),
                reason: "run timeout exceeded".into(),
                stage_failed: false,
            };
        }

        state.current_stage = Some(name.clone());
        let started = Instant::now();

        if let Precondition::Unsatisfied { reason } = stage.precondition(state) {
            warn!(stage = %name, reason = %reason, "Stage precondition unsatisfied; skipping");
            state.record_warning(Some(&name), format!("stage skipped: {reason}"));
            state.clear(stage.output_slot());
            outcomes.push(StageOutcome {
                stage: name.clone(),
                status: StageStatus::Skipped,
                elapsed: started.elapsed(),
                error: Some(reason.clone()),
            });
            if halt {
                state.record_error(Some(&name), format!("precondition unsatisfied: {reason}"));
                return Step::Abort {
                    stage: Some(name),
                    reason: format!("precondition unsatisfied: {reason}"),
                    stage_failed: true,
                };
            }
            return Step::Next(index + 1);
        }

        let limit = self.settings.stage_timeout.min(remaining);
        let ctx = StageContext {
            run_id,
            cancel: cancel.child_token(),
            rework: state.rework_count,
        };
        let span = info_span!("stage", stage = %name, rework = ctx.rework);
        let result = execute_guarded(stage, state, &ctx, limit, cancel)
            .instrument(span)
            .await;
        ctx.cancel.cancel();
        let elapsed = started.elapsed();

        let failure = match result {
            Ok(commit) => match state.apply(&name, stage.output_slot(), commit) {
                Ok(()) => None,
                Err(violation) => Some(StageFailure::Fault {
                    message: violation.to_string(),
                }),
            },
            Err(failure) => Some(failure),
        };

        let Some(failure) = failure else {
            info!(stage = %name, elapsed_ms = elapsed.as_millis() as u64, "Stage committed");
            outcomes.push(StageOutcome {
                stage: name.clone(),
                status: StageStatus::Succeeded,
                elapsed,
                error: None,
            });
            return Step::Next(self.next_index(index, &name, state));
        };

        let status = match &failure {
            StageFailure::Cancelled => StageStatus::Cancelled,
            StageFailure::TimedOut { .. } => StageStatus::TimedOut,
            StageFailure::Invocation { .. } | StageFailure::Fault { .. } => StageStatus::Failed,
        };
        warn!(stage = %name, error = %failure, "Stage failed");
        state.record_error(Some(&name), failure.to_string());
        state.clear(stage.output_slot());
        outcomes.push(StageOutcome {
            stage: name.clone(),
            status,
            elapsed,
            error: Some(failure.to_string()),
        });

        let run_timed_out = matches!(failure, StageFailure::TimedOut { .. }) && limit < self.settings.stage_timeout;
        if cancel.is_cancelled() || status == StageStatus::Cancelled {
            Step::Abort {
                stage: Some(name),
                reason: "cancelled".into(),
                stage_failed: false,
            }
        } else if run_timed_out {
            Step::Abort {
                stage: Some(name),
                reason: "run timeout exceeded".into(),
                stage_failed: false,
            }
        } else if halt {
            Step::Abort {
                stage: Some(name),
                reason: failure.to_string(),
                stage_failed: true,
            }
        } else {
            Step::Next(index + 1)
        }
    }

    /// Index of the stage to run after `name` succeeded.
    fn next_index(&self, index: usize, name: &StageName, state: &mut PipelineState) -> usize {
        let Some(revision) = &self.settings.revision else {
            return index + 1;
        };
        if &revision.gate_stage != name {
            return index + 1;
        }
        let Some(quality) = &state.quality else {
            return index + 1;
        };
        if quality.overall.meets(revision.min_quality_score) {
            return index + 1;
        }

        let score = quality.overall;
        if state.rework_count < revision.max_reworks {
            let Some(restart) = self.index_of(&revision.restart_from) else {
                return index + 1;
            };
            state.rework_count += 1;
            info!(
                score = score.as_f64(),
                minimum = revision.min_quality_score,
                rework = state.rework_count,
                "Quality below minimum; starting revision pass"
            );
            state.record_warning(
                Some(name),
                format!(
                    "quality score {score} below minimum {:.2}; revision pass {} of {}",
                    revision.min_quality_score, state.rework_count, revision.max_reworks
                ),
            );
            restart
        } else {
            state.record_warning(
                Some(name),
                format!(
                    "quality score {score} still below minimum {:.2} after {} revision pass(es)",
                    revision.min_quality_score, state.rework_count
                ),
            );
            index + 1
        }
    }

    fn index_of(&self, name: &StageName) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    fn running_status(&self, index: usize) -> RunStatus {
        match self.stages.get(index) {
            Some(stage) => RunStatus::Running {
                stage: stage.name().clone(),
            },
            None => RunStatus::Completed,
        }
    }

    /// Persists a checkpoint. A store failure is logged; the run continues.
    async fn save(
        &self,
        run_id: PipelineRunId,
        status: RunStatus,
        state: &PipelineState,
        next: Option<usize>,
        outcomes: &[StageOutcome],
    ) {
        let checkpoint = Checkpoint {
            run_id,
            status,
            state: state.clone(),
            next_stage: next.and_then(|i| self.stages.get(i)).map(|s| s.name().clone()),
            outcomes: outcomes.to_vec(),
            updated_at: Timestamp::now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            error!(run_id = %run_id, error = %e, "Failed to save checkpoint");
        }
    }
}

/// Executes one stage with a timeout, cancellation and panic capture.
async fn execute_guarded(
    stage: &dyn Stage,
    state: &PipelineState,
    ctx: &StageContext,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<StageCommit, StageFailure> {
    let guarded = AssertUnwindSafe(stage.execute(state, ctx)).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageFailure::Cancelled),
        result = tokio::time::timeout(limit, guarded) => match result {
            Err(_) => Err(StageFailure::TimedOut { after: limit }),
            Ok(Err(panic)) => Err(StageFailure::Fault {
                message: format!("stage panicked: {}", panic_message(panic.as_ref())),
            }),
            Ok(Ok(outcome)) => outcome,
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use async_trait::async_trait;
    use pipeline::{
        OutputSlot, Paper, QualityAssessment, QualityLevel, QualityScore, SourceName, StageOutput,
        Synthesis,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behaviour {
        Papers(usize),
        Fail,
        Panic,
        Hang,
        Synthesis,
        Quality(f64),
        RequirePapers,
    }

    struct TestStage {
        name: StageName,
        slot: OutputSlot,
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    fn stage(name: &'static str, slot: OutputSlot, behaviour: Behaviour) -> Arc<TestStage> {
        Arc::new(TestStage {
            name: StageName::from_static(name),
            slot,
            behaviour,
            calls: AtomicU32::new(0),
        })
    }

    #[async_trait]
    impl Stage for TestStage {
        fn name(&self) -> &StageName {
            &self.name
        }

        fn output_slot(&self) -> OutputSlot {
            self.slot
        }

        fn precondition(&self, state: &PipelineState) -> Precondition {
            match self.behaviour {
                Behaviour::RequirePapers => {
                    Precondition::require(!state.papers.is_empty(), "no candidate documents")
                }
                _ => Precondition::Satisfied,
            }
        }

        async fn execute(&self, _state: &PipelineState, ctx: &StageContext) -> Result<StageCommit, StageFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Papers(n) => Ok(StageCommit::new(StageOutput::Papers(
                    (0..n)
                        .map(|i| Paper::new(format!("p{i}"), SourceName::from_static("fake")))
                        .collect(),
                ))),
                Behaviour::Fail => Err(StageFailure::Fault {
                    message: "boom".into(),
                }),
                Behaviour::Panic => panic!("stage exploded"),
                Behaviour::Hang => {
                    ctx.cancel.cancelled().await;
                    Err(StageFailure::Cancelled)
                }
                Behaviour::Synthesis => Ok(StageCommit::new(StageOutput::Synthesis(Synthesis {
                    summary: "s".into(),
                    insights: Vec::new(),
                    revision: ctx.rework,
                }))),
                Behaviour::Quality(score) => {
                    let overall = QualityScore::clamped(score);
                    Ok(StageCommit::new(StageOutput::Quality(QualityAssessment {
                        overall,
                        level: QualityLevel::from_score(overall),
                        completeness: 1.0,
                        citation_coverage: 1.0,
                        aspects: None,
                        feedback: "needs depth".into(),
                        recommendations: Vec::new(),
                        passed: score >= 0.8,
                    })))
                }
                Behaviour::RequirePapers => Ok(StageCommit::new(StageOutput::AnalyzedDocuments(Vec::new()))),
            }
        }
    }

    fn executor(stages: Vec<Arc<TestStage>>, settings: ExecutorSettings) -> PipelineExecutor {
        let stages = stages.into_iter().map(|s| s as Arc<dyn Stage>).collect();
        PipelineExecutor::new(stages, settings, Arc::new(InMemoryCheckpointStore::new())).unwrap()
    }

    fn settings(policy: FailurePolicy) -> ExecutorSettings {
        ExecutorSettings {
            stage_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(60),
            failure_policy: policy,
            revision: None,
        }
    }

    fn initial_state() -> PipelineState {
        PipelineState::new(ResearchQuery::builder("Why do students misread graphs?").build().unwrap())
    }

    #[tokio::test]
    async fn test_stage_fault_is_recorded_and_run_continues() {
        let exec = executor(
            vec![
                stage("search", OutputSlot::Papers, Behaviour::Fail),
                stage("analysis", OutputSlot::AnalyzedDocuments, Behaviour::RequirePapers),
            ],
            settings(FailurePolicy::Continue),
        );
        let outcome = exec.run(initial_state()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.outcomes[0].status, StageStatus::Failed);
        assert_eq!(outcome.outcomes[1].status, StageStatus::Skipped);
        assert!(outcome.state.errors[0].message.contains("boom"));
        assert!(outcome.run_error().is_none());
    }

    #[tokio::test]
    async fn test_halt_policy_aborts_on_failure() {
        let later = stage("analysis", OutputSlot::AnalyzedDocuments, Behaviour::RequirePapers);
        let exec = executor(
            vec![stage("search", OutputSlot::Papers, Behaviour::Fail), later.clone()],
            settings(FailurePolicy::Halt),
        );
        let outcome = exec.run(initial_state()).await.unwrap();
        assert!(matches!(outcome.status, RunStatus::Aborted { stage: Some(ref s), .. } if s.as_str() == "search"));
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.run_error().unwrap().contains("search"));
    }

    /// Records every status saved, in order.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryCheckpointStore,
        statuses: std::sync::Mutex<Vec<RunStatus>>,
    }

    #[async_trait]
    impl CheckpointStore for RecordingStore {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<(), ResearchError> {
            self.statuses.lock().unwrap().push(checkpoint.status.clone());
            self.inner.save(checkpoint).await
        }

        async fn load(&self, run_id: PipelineRunId) -> Result<Option<Checkpoint>, ResearchError> {
            self.inner.load(run_id).await
        }
    }

    #[tokio::test]
    async fn test_halt_policy_aborts_on_unsatisfied_precondition() {
        let analysis = stage("analysis", OutputSlot::AnalyzedDocuments, Behaviour::RequirePapers);
        let report = stage("report", OutputSlot::Report, Behaviour::Fail);
        let store = Arc::new(RecordingStore::default());
        let exec = PipelineExecutor::new(
            vec![
                stage("search", OutputSlot::Papers, Behaviour::Papers(0)) as Arc<dyn Stage>,
                analysis.clone() as Arc<dyn Stage>,
                report.clone() as Arc<dyn Stage>,
            ],
            settings(FailurePolicy::Halt),
            store.clone(),
        )
        .unwrap();

        let run_id = PipelineRunId::new_random();
        let outcome = exec
            .run_as(run_id, initial_state(), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome.status, RunStatus::Aborted { stage: Some(ref s), .. } if s.as_str() == "analysis"));
        assert_eq!(analysis.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.outcomes[1].status, StageStatus::Skipped);
        assert!(outcome.run_error().unwrap().contains("precondition unsatisfied"));
        assert!(outcome
            .state
            .warnings
            .iter()
            .any(|w| w.message.contains("no candidate documents")));

        let statuses = store.statuses.lock().unwrap().clone();
        let tail = &statuses[statuses.len() - 3..];
        assert_eq!(tail[0], RunStatus::Running { stage: StageName::from_static("analysis") });
        assert_eq!(tail[1], RunStatus::StageFailed { stage: StageName::from_static("analysis") });
        assert!(matches!(tail[2], RunStatus::Aborted { .. }));

        let report = exec.status(run_id).await.unwrap();
        assert!(report.complete);
        assert!(matches!(report.status, RunStatus::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_panicking_stage_is_captured_as_fault() {
        let exec = executor(
            vec![stage("search", OutputSlot::Papers, Behaviour::Panic)],
            settings(FailurePolicy::Continue),
        );
        let outcome = exec.run(initial_state()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.state.errors[0].message.contains("stage exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout_is_tolerated_under_continue() {
        let exec = executor(
            vec![
                stage("search", OutputSlot::Papers, Behaviour::Hang),
                stage("more", OutputSlot::Validations, Behaviour::Fail),
            ],
            settings(FailurePolicy::Continue),
        );
        let outcome = exec.run(initial_state()).await.unwrap();
        assert_eq!(outcome.outcomes[0].status, StageStatus::TimedOut);
        assert_eq!(outcome.outcomes.len(), 2);
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_aborts_the_run() {
        let mut s = settings(FailurePolicy::Continue);
        s.run_timeout = Duration::from_secs(3);
        let exec = executor(
            vec![
                stage("search", OutputSlot::Papers, Behaviour::Hang),
                stage("more", OutputSlot::Validations, Behaviour::Fail),
            ],
            s,
        );
        let outcome = exec.run(initial_state()).await.unwrap();
        match &outcome.status {
            RunStatus::Aborted { reason, .. } => assert!(reason.contains("run timeout")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(outcome.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_without_running_further_stages() {
        let later = stage("more", OutputSlot::Validations, Behaviour::Fail);
        let exec = executor(
            vec![stage("search", OutputSlot::Papers, Behaviour::Hang), later.clone()],
            settings(FailurePolicy::Continue),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            trigger.cancel();
        });
        let outcome = exec.run_with_cancellation(initial_state(), cancel).await.unwrap();
        assert!(matches!(outcome.status, RunStatus::Aborted { .. }));
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_commit_to_foreign_slot_is_a_fault() {
        let exec = executor(
            vec![stage("search", OutputSlot::Validations, Behaviour::Papers(2))],
            settings(FailurePolicy::Continue),
        );
        let outcome = exec.run(initial_state()).await.unwrap();
        assert!(outcome.state.papers.is_empty());
        assert_eq!(outcome.outcomes[0].status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn test_low_quality_triggers_bounded_revision_loop() {
        let synthesis = stage("content_synthesis", OutputSlot::Synthesis, Behaviour::Synthesis);
        let quality = stage("quality_control", OutputSlot::Quality, Behaviour::Quality(0.5));
        let mut s = settings(FailurePolicy::Continue);
        s.revision = Some(RevisionLoop {
            gate_stage: StageName::from_static("quality_control"),
            restart_from: StageName::from_static("content_synthesis"),
            max_reworks: 2,
            min_quality_score: 0.8,
        });
        let exec = executor(
            vec![stage("search", OutputSlot::Papers, Behaviour::Papers(1)), synthesis.clone(), quality.clone()],
            s,
        );
        let outcome = exec.run(initial_state()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(synthesis.calls.load(Ordering::SeqCst), 3);
        assert_eq!(quality.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.state.rework_count, 2);
        assert_eq!(outcome.state.synthesis.unwrap().revision, 2);
        assert!(outcome
            .state
            .warnings
            .iter()
            .any(|w| w.message.contains("still below minimum")));
    }

    #[tokio::test]
    async fn test_status_and_resume_use_checkpoints() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let stages: Vec<Arc<dyn Stage>> = vec![
            stage("search", OutputSlot::Papers, Behaviour::Papers(2)),
            stage("analysis", OutputSlot::AnalyzedDocuments, Behaviour::RequirePapers),
        ];
        let exec = PipelineExecutor::new(stages, settings(FailurePolicy::Continue), store.clone()).unwrap();
        let outcome = exec.run(initial_state()).await.unwrap();

        let report = exec.status(outcome.run_id).await.unwrap();
        assert!(report.complete);
        assert_eq!(report.status, RunStatus::Completed);

        // Rewind the checkpoint to "analysis pending" and resume.
        let mut checkpoint = store.load(outcome.run_id).await.unwrap().unwrap();
        checkpoint.status = RunStatus::Running {
            stage: StageName::from_static("analysis"),
        };
        checkpoint.next_stage = Some(StageName::from_static("analysis"));
        checkpoint.outcomes.truncate(1);
        store.save(&checkpoint).await.unwrap();

        let resumed = exec.resume(outcome.run_id, CancellationToken::new()).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.outcomes.len(), 2);
        assert_eq!(resumed.state.papers.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_run_and_invalid_query_are_setup_errors() {
        let exec = executor(
            vec![stage("search", OutputSlot::Papers, Behaviour::Papers(1))],
            settings(FailurePolicy::Continue),
        );
        let err = exec.status(PipelineRunId::new_random()).await.unwrap_err();
        assert!(matches!(err, ResearchError::UnknownRun { .. }));

        let mut state = initial_state();
        state.query.question = "  ".into();
        let err = exec.run(state).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidQuery { .. }));
    }

    #[test]
    fn test_duplicate_stage_names_are_rejected() {
        let stages: Vec<Arc<dyn Stage>> = vec![
            stage("search", OutputSlot::Papers, Behaviour::Papers(1)),
            stage("search", OutputSlot::Papers, Behaviour::Papers(1)),
        ];
        let result = PipelineExecutor::new(
            stages,
            settings(FailurePolicy::Continue),
            Arc::new(InMemoryCheckpointStore::new()),
        );
        assert!(matches!(result, Err(ResearchError::Configuration { .. })));
    }
}
