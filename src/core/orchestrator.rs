//! Main orchestrator for workflow execution.
//!
//! Drives runs through the stage graph: resolves inputs, invokes the task
//! executor or the approval gate, checks declared outputs, checkpoints and
//! advances. A run paused at an approval stage releases its driver; the
//! persisted `awaiting_approval` record is what lets the process restart
//! while the run waits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agents::Inputs;
use crate::config::ExecutionSettings;
use crate::domain::{
    ApprovalRequest, Artifact, Decision, Event, EventType, ReplayOrigin, Run, RunError, RunStatus,
    SaveOutcome,
};
use crate::error::{ErrorKind, OrchestratorError, Result};

use super::approval::ApprovalGate;
use super::checkpoint::CheckpointRepository;
use super::executor::{ExecutionScope, TaskExecutor};
use super::journal::Journal;
use super::stages::{ApprovalStage, Stage, StageKind, Workflow, APPROVAL_PRODUCER, PARAMS_INPUT};

/// Live state of one run.
///
/// The run itself sits behind a read/write lock; `driver` guarantees that
/// at most one task advances the run at a time.
pub struct RunHandle {
    run: RwLock<Run>,
    cancel: CancellationToken,
    driver: Mutex<()>,
    status: watch::Sender<RunStatus>,
}

impl RunHandle {
    fn new(run: Run) -> Self {
        let (status, _) = watch::channel(run.status);
        Self {
            run: RwLock::new(run),
            cancel: CancellationToken::new(),
            driver: Mutex::new(()),
            status,
        }
    }

    pub fn id(&self) -> Uuid {
        self.run.read().id
    }

    pub fn snapshot(&self) -> Run {
        self.run.read().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.run.read().status
    }

    /// Status updates, starting from the current status
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Apply `f` to a non-terminal run
    fn mutate<T>(&self, f: impl FnOnce(&mut Run) -> Result<T>) -> Result<T> {
        let mut run = self.run.write();
        match run.status {
            RunStatus::Aborted => return Err(OrchestratorError::Aborted(run.id)),
            status if status.is_terminal() => {
                return Err(OrchestratorError::InvalidState(format!(
                    "run {} is already {}",
                    run.id, status
                )))
            }
            _ => {}
        }

        let out = f(&mut run)?;
        run.updated_at = Utc::now();
        self.status.send_replace(run.status);
        Ok(out)
    }
}

/// Result of executing one stage
enum StageStep {
    Completed,
    Paused,
    Revised,
    Failed,
}

/// Main workflow orchestrator
pub struct Orchestrator {
    workflow: Arc<Workflow>,
    execution: ExecutionSettings,
    executor: TaskExecutor,
    checkpoints: Arc<CheckpointRepository>,
    gate: Arc<ApprovalGate>,
    journal: Journal,
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
}

impl Orchestrator {
    pub fn new(
        workflow: Arc<Workflow>,
        execution: ExecutionSettings,
        executor: TaskExecutor,
        checkpoints: Arc<CheckpointRepository>,
        gate: Arc<ApprovalGate>,
        journal: Journal,
    ) -> Self {
        Self {
            workflow,
            execution,
            executor,
            checkpoints,
            gate,
            journal,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn checkpoints(&self) -> &CheckpointRepository {
        &self.checkpoints
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Handle of a run loaded in this process
    pub fn handle(&self, run_id: Uuid) -> Option<Arc<RunHandle>> {
        self.runs.read().get(&run_id).cloned()
    }

    /// Number of runs with a live handle in this process
    pub fn live_runs(&self) -> usize {
        self.runs.read().len()
    }

    fn register(&self, run: Run) -> Arc<RunHandle> {
        let id = run.id;
        Arc::clone(
            self.runs
                .write()
                .entry(id)
                .or_insert_with(|| Arc::new(RunHandle::new(run))),
        )
    }

    /// Create and persist a pending run
    #[instrument(skip(self, params))]
    pub async fn create_run(&self, subject_key: &str, params: Value) -> Result<Arc<RunHandle>> {
        let run = Run::new(Uuid::new_v4(), subject_key.to_string(), params);
        let run_id = run.id;
        let handle = self.register(run);

        self.checkpoints.register_run(run_id).await;
        self.persist_record(&handle).await;
        self.journal
            .record(Event::new(
                run_id,
                None,
                EventType::RunStarted,
                format!("Run for '{}' created", subject_key),
            ))
            .await;

        info!(%run_id, "run created");
        Ok(handle)
    }

    /// Advance a run until it completes, fails, pauses or is aborted.
    ///
    /// Stage failures are recorded on the run, not returned.
    #[instrument(skip(self, handle), fields(run_id = %handle.id()))]
    pub async fn drive(&self, handle: Arc<RunHandle>) -> Result<Run> {
        let _driver = handle.driver.lock().await;

        match self.advance(&handle).await {
            Ok(()) => {}
            Err(OrchestratorError::Aborted(_)) => debug!("run aborted, driver stopping"),
            Err(e) => {
                error!(error = %e, "driver failed unexpectedly");
                let stage_index = handle.snapshot().current_stage_index;
                self.fail_run(&handle, e.kind(), Some(stage_index), e.to_string())
                    .await
                    .ok();
            }
        }

        self.release(&handle);
        Ok(handle.snapshot())
    }

    /// Drop in-process state of a finished run; reads fall back to the store
    fn release(&self, handle: &RunHandle) {
        if !handle.status().is_terminal() {
            return;
        }

        let run_id = handle.id();
        self.runs.write().remove(&run_id);
        self.gate.release(run_id);
        if !self.checkpoints.release(run_id) {
            debug!(%run_id, "run state kept in memory until its flush completes");
        }
    }

    async fn advance(&self, handle: &RunHandle) -> Result<()> {
        let run_id = handle.id();

        match handle.status() {
            status if status.is_terminal() => return Ok(()),
            RunStatus::AwaitingApproval => {
                // Only continue once a decision has been recorded
                match self.gate.load(run_id).await {
                    Ok(request) if !request.is_pending() => {}
                    _ => return Ok(()),
                }
                handle.mutate(|run| run.transition(RunStatus::Running))?;
            }
            RunStatus::Pending => {
                handle.mutate(|run| run.transition(RunStatus::Running))?;
            }
            _ => {}
        }
        self.persist_record(handle).await;

        loop {
            if handle.is_cancelled() {
                return Err(OrchestratorError::Aborted(run_id));
            }

            let (index, revision) = {
                let run = handle.run.read();
                (run.current_stage_index, run.revision)
            };
            let Some(stage) = self.workflow.stages.get(index) else {
                break;
            };

            self.journal
                .record(Event::new(
                    run_id,
                    Some(index),
                    EventType::StageStarted,
                    format!("Stage '{}' started", stage.name),
                ))
                .await;

            let step = match stage.kind() {
                StageKind::Agent(agent) => {
                    self.run_agent_stage(handle, index, revision, stage, agent)
                        .await?
                }
                StageKind::Approval(approval) => {
                    self.run_approval_stage(handle, index, revision, stage, approval)
                        .await?
                }
            };

            match step {
                StageStep::Completed => {
                    if !self.complete_stage(handle, index, stage).await? {
                        return Ok(());
                    }
                }
                StageStep::Revised => continue,
                StageStep::Paused | StageStep::Failed => return Ok(()),
            }
        }

        handle.mutate(|run| run.transition(RunStatus::Completed))?;
        self.persist_record(handle).await;
        self.journal
            .record(Event::new(run_id, None, EventType::RunCompleted, "Run completed"))
            .await;
        info!(%run_id, "run completed");
        Ok(())
    }

    async fn run_agent_stage(
        &self,
        handle: &RunHandle,
        index: usize,
        revision: u32,
        stage: &Stage,
        agent: &str,
    ) -> Result<StageStep> {
        let run_id = handle.id();

        let inputs = match self.resolve_inputs(handle, stage) {
            Ok(inputs) => inputs,
            Err(message) => {
                self.fail_run(handle, ErrorKind::TerminalTask, Some(index), message)
                    .await?;
                return Ok(StageStep::Failed);
            }
        };

        let scope = ExecutionScope {
            run_id,
            revision,
            stage_index: index,
            stage_name: stage.name.clone(),
            cancel: handle.cancel.clone(),
        };
        let budget = stage.budget(&self.execution);

        match self.executor.execute(agent, inputs, budget, &scope).await {
            Ok(report) => {
                let missing: Vec<&str> = stage
                    .outputs
                    .iter()
                    .filter(|name| !report.outputs.contains_key(name.as_str()))
                    .map(String::as_str)
                    .collect();
                if !missing.is_empty() {
                    let message = format!(
                        "agent '{}' did not produce declared output(s): {}",
                        agent,
                        missing.join(", ")
                    );
                    self.fail_run(handle, ErrorKind::TerminalTask, Some(index), message)
                        .await?;
                    return Ok(StageStep::Failed);
                }

                let extra: Vec<&String> = report
                    .outputs
                    .keys()
                    .filter(|name| !stage.outputs.contains(name))
                    .collect();
                if !extra.is_empty() {
                    debug!(stage = %stage.name, ?extra, "ignoring undeclared outputs");
                }

                handle.mutate(|run| {
                    run.stage_attempts.insert(index, report.attempts.len() as u32);
                    for name in &stage.outputs {
                        let content = report.outputs[name].clone();
                        run.insert_artifact(Artifact::new(name.clone(), index, agent, content));
                    }
                    Ok(())
                })?;
                Ok(StageStep::Completed)
            }
            Err(e) if e.kind == ErrorKind::Aborted => Err(OrchestratorError::Aborted(run_id)),
            Err(e) => {
                handle.mutate(|run| {
                    run.stage_attempts.insert(index, e.attempts.len() as u32);
                    Ok(())
                })?;
                self.fail_run(handle, e.kind, Some(index), e.to_string())
                    .await?;
                Ok(StageStep::Failed)
            }
        }
    }

    async fn run_approval_stage(
        &self,
        handle: &RunHandle,
        index: usize,
        revision: u32,
        stage: &Stage,
        approval: &ApprovalStage,
    ) -> Result<StageStep> {
        let run_id = handle.id();

        let decided = match self.gate.load(run_id).await {
            Ok(request) if request.matches(revision, index) && !request.is_pending() => Some(request),
            _ => None,
        };

        let Some(request) = decided else {
            let summary = self.approval_summary(handle, stage, approval);
            let request = self.gate.request(run_id, revision, index, summary).await;

            handle.mutate(|run| run.transition(RunStatus::AwaitingApproval))?;
            self.persist_record(handle).await;
            self.journal
                .record(Event::new(
                    run_id,
                    Some(index),
                    EventType::ApprovalRequested,
                    format!("Approval requested at stage '{}'", stage.name),
                ))
                .await;

            info!(%run_id, stage = %stage.name, expires_at = %request.expires_at, "awaiting approval");
            return Ok(StageStep::Paused);
        };

        match request.decision {
            Decision::Approved => {
                if let Some(output) = stage.outputs.first() {
                    let record = decision_record(&request);
                    handle.mutate(|run| {
                        run.insert_artifact(Artifact::new(
                            output.clone(),
                            index,
                            APPROVAL_PRODUCER,
                            record,
                        ));
                        Ok(())
                    })?;
                }
                Ok(StageStep::Completed)
            }
            Decision::Revise => {
                let target = request
                    .revise_to
                    .or_else(|| self.workflow.revise_target(index))
                    .unwrap_or(0);
                self.apply_revision(handle, index, target, &request).await?;
                Ok(StageStep::Revised)
            }
            Decision::Rejected => {
                let message = OrchestratorError::ApprovalRejected {
                    run_id,
                    notes: request.notes.clone(),
                }
                .to_string();
                self.fail_run(handle, ErrorKind::ApprovalRejected, Some(index), message)
                    .await?;
                Ok(StageStep::Failed)
            }
            Decision::Expired | Decision::Pending => {
                let message = OrchestratorError::ApprovalTimeout {
                    run_id,
                    waited_seconds: request.max_wait_seconds(),
                }
                .to_string();
                self.fail_run(handle, ErrorKind::ApprovalTimeout, Some(index), message)
                    .await?;
                Ok(StageStep::Failed)
            }
        }
    }

    /// Send the run back to `target` under a new revision
    async fn apply_revision(
        &self,
        handle: &RunHandle,
        index: usize,
        target: usize,
        request: &ApprovalRequest,
    ) -> Result<()> {
        let revision = handle.mutate(|run| {
            run.revision += 1;
            run.current_stage_index = target;
            run.discard_artifacts_from(target);
            run.stage_attempts.retain(|stage, _| *stage < target);
            Ok(run.revision)
        })?;

        self.persist_record(handle).await;
        let mut event = Event::new(
            handle.id(),
            Some(index),
            EventType::RunRevised,
            format!("Revision {} resumes at stage {}", revision, target),
        );
        if let Some(notes) = &request.notes {
            event = event.with_error(notes.clone());
        }
        self.journal.record(event).await;

        info!(run_id = %handle.id(), revision, target, "run sent back for revision");
        Ok(())
    }

    /// Checkpoint a completed stage and advance. Returns false when the
    /// run failed because the checkpoint could not be written.
    async fn complete_stage(&self, handle: &RunHandle, index: usize, stage: &Stage) -> Result<bool> {
        let run_id = handle.id();

        let (revision, state) = handle.mutate(|run| {
            run.current_stage_index = index + 1;
            Ok((run.revision, serde_json::to_value(&*run)?))
        })?;

        match self.checkpoints.save(run_id, revision, index, state).await {
            Ok(outcome) => {
                let (event_type, summary) = match outcome {
                    SaveOutcome::Durable => (EventType::CheckpointSaved, "Checkpoint saved"),
                    SaveOutcome::Degraded => (
                        EventType::CheckpointDegraded,
                        "Checkpoint held in memory; run cannot resume after a restart",
                    ),
                };
                self.journal
                    .record(Event::new(run_id, Some(index), event_type, summary))
                    .await;
            }
            Err(e) => {
                self.fail_run(handle, e.kind(), Some(index), e.to_string())
                    .await?;
                return Ok(false);
            }
        }

        let degraded = self.checkpoints.is_degraded(run_id);
        handle.mutate(|run| {
            run.checkpoint_degraded = degraded;
            Ok(())
        })?;
        self.persist_record(handle).await;
        self.journal
            .record(Event::new(
                run_id,
                Some(index),
                EventType::StageCompleted,
                format!("Stage '{}' completed", stage.name),
            ))
            .await;

        Ok(true)
    }

    fn resolve_inputs(&self, handle: &RunHandle, stage: &Stage) -> std::result::Result<Inputs, String> {
        let run = handle.run.read();
        let mut inputs = Inputs::new();

        for name in &stage.inputs {
            let value = if name == PARAMS_INPUT {
                run.params.clone()
            } else {
                run.artifacts
                    .get(name)
                    .map(|a| a.content.clone())
                    .ok_or_else(|| {
                        format!("stage '{}' needs artifact '{}', which is missing", stage.name, name)
                    })?
            };
            inputs.insert(name.clone(), value);
        }

        Ok(inputs)
    }

    fn approval_summary(&self, handle: &RunHandle, stage: &Stage, approval: &ApprovalStage) -> String {
        let run = handle.run.read();
        let artifact = approval
            .summary_from
            .as_ref()
            .and_then(|name| run.artifacts.get(name));

        match artifact.map(|a| &a.content) {
            Some(Value::String(text)) => text.clone(),
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            None => format!("Approve stage '{}' for '{}'", stage.name, run.subject_key),
        }
    }

    async fn fail_run(
        &self,
        handle: &RunHandle,
        kind: ErrorKind,
        stage_index: Option<usize>,
        message: String,
    ) -> Result<()> {
        handle.mutate(|run| run.fail(kind, stage_index, message.clone()))?;
        self.persist_record(handle).await;

        let mut event = Event::new(handle.id(), stage_index, EventType::RunFailed, "Run failed")
            .with_error(message.clone());
        if let Some(attempts) = stage_index.and_then(|i| handle.run.read().stage_attempts.get(&i).copied()) {
            event = event.with_attempt(attempts);
        }
        self.journal.record(event).await;

        error!(run_id = %handle.id(), %kind, ?stage_index, error = %message, "run failed");
        Ok(())
    }

    /// Write the run record; failures are logged by the repository
    async fn persist_record(&self, handle: &RunHandle) {
        let snapshot = handle.snapshot();
        if let Err(e) = self.checkpoints.save_run_record(&snapshot).await {
            warn!(run_id = %snapshot.id, error = %e, "run record not persisted");
        }
    }

    /// Record a reviewer decision on a paused run.
    ///
    /// Approve and revise put the run back to `running`; the caller drives
    /// it. Reject fails the run immediately.
    #[instrument(skip(self, notes, decider))]
    pub async fn decide(
        &self,
        run_id: Uuid,
        decision: Decision,
        notes: Option<String>,
        decider: Option<String>,
        revise_to: Option<usize>,
    ) -> Result<ApprovalRequest> {
        let handle = self.recover(run_id).await?;
        let pending = self.gate.load(run_id).await?;

        // Decided requests are left to the gate so late callers see AlreadyDecided
        if pending.is_pending() && handle.status().is_terminal() {
            return Err(match handle.status() {
                RunStatus::Aborted => OrchestratorError::Aborted(run_id),
                status => OrchestratorError::InvalidState(format!(
                    "run {} is {}, not awaiting approval",
                    run_id, status
                )),
            });
        }

        let revise_to = match decision {
            Decision::Revise => revise_to.or_else(|| self.workflow.revise_target(pending.stage_index)),
            _ => None,
        };

        let decided = match self.gate.decide(run_id, decision, notes, decider, revise_to).await {
            Ok(decided) => decided,
            Err(e @ OrchestratorError::ApprovalTimeout { .. }) => {
                self.fail_awaiting(&handle, ErrorKind::ApprovalTimeout, pending.stage_index, e.to_string())
                    .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.journal
            .record(
                Event::new(
                    run_id,
                    Some(decided.stage_index),
                    EventType::ApprovalDecided,
                    format!("Approval {} by {}", decided.decision, decided.decider.as_deref().unwrap_or("unknown")),
                )
                .with_idempotency_key(format!("{}:{}:{}", run_id, decided.revision, decided.stage_index)),
            )
            .await;

        match decided.decision {
            Decision::Rejected => {
                let message = OrchestratorError::ApprovalRejected {
                    run_id,
                    notes: decided.notes.clone(),
                }
                .to_string();
                self.fail_awaiting(&handle, ErrorKind::ApprovalRejected, decided.stage_index, message)
                    .await;
            }
            _ => {
                handle.mutate(|run| run.transition(RunStatus::Running))?;
                self.persist_record(&handle).await;
            }
        }

        Ok(decided)
    }

    async fn fail_awaiting(&self, handle: &RunHandle, kind: ErrorKind, stage_index: usize, message: String) {
        if handle.status() == RunStatus::AwaitingApproval {
            if let Err(e) = self.fail_run(handle, kind, Some(stage_index), message).await {
                warn!(run_id = %handle.id(), error = %e, "could not fail paused run");
            }
            self.release(handle);
        }
    }

    /// Expire a pending approval and fail its run
    pub async fn expire_approval(&self, run_id: Uuid) -> Result<ApprovalRequest> {
        let handle = self.recover(run_id).await?;
        let expired = self.gate.expire(run_id).await?;

        self.journal
            .record(Event::new(
                run_id,
                Some(expired.stage_index),
                EventType::ApprovalExpired,
                format!("Approval expired after {}s", expired.max_wait_seconds()),
            ))
            .await;

        let message = OrchestratorError::ApprovalTimeout {
            run_id,
            waited_seconds: expired.max_wait_seconds(),
        }
        .to_string();
        self.fail_awaiting(&handle, ErrorKind::ApprovalTimeout, expired.stage_index, message)
            .await;

        Ok(expired)
    }

    /// Expire every pending approval past its deadline at `now`
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for request in self.gate.expired(now).await {
            match self.expire_approval(request.run_id).await {
                Ok(_) => expired.push(request.run_id),
                Err(e) => warn!(run_id = %request.run_id, error = %e, "could not expire approval"),
            }
        }
        expired
    }

    /// Abort a running or paused run
    #[instrument(skip(self))]
    pub async fn abort(&self, run_id: Uuid) -> Result<Run> {
        let handle = self.recover(run_id).await?;

        let status = handle.status();
        if status.is_terminal() {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} is already {}",
                run_id, status
            )));
        }

        let snapshot = handle.mutate(|run| {
            let stage_index = run.current_stage_index;
            run.transition(RunStatus::Aborted)?;
            run.error = Some(RunError {
                kind: ErrorKind::Aborted,
                stage_index: Some(stage_index),
                message: format!("run {} was aborted", run_id),
            });
            Ok(run.clone())
        })?;
        handle.cancel.cancel();

        // Terminal record doubles as the final checkpoint
        self.persist_record(&handle).await;
        self.journal
            .record(Event::new(
                run_id,
                Some(snapshot.current_stage_index),
                EventType::RunAborted,
                "Run aborted",
            ))
            .await;

        info!(%run_id, stage_index = snapshot.current_stage_index, "run aborted");
        self.release(&handle);
        Ok(snapshot)
    }

    /// Start a new run re-executing from `from_stage`, seeded from the
    /// checkpoint of the stage before it. The source run is not touched.
    #[instrument(skip(self))]
    pub async fn replay(&self, run_id: Uuid, from_stage: usize) -> Result<Arc<RunHandle>> {
        if from_stage >= self.workflow.len() {
            return Err(OrchestratorError::InvalidInput(format!(
                "stage {} is out of range (workflow has {} stages)",
                from_stage,
                self.workflow.len()
            )));
        }

        let source = self.get_run(run_id).await?;
        let seed: Run = if from_stage == 0 {
            source
        } else {
            let checkpoint = self.checkpoints.load_at(run_id, from_stage - 1).await?;
            serde_json::from_value(checkpoint.state)?
        };

        let mut run = Run::new(Uuid::new_v4(), seed.subject_key.clone(), seed.params.clone());
        run.current_stage_index = from_stage;
        run.artifacts = seed
            .artifacts
            .iter()
            .filter(|(_, artifact)| artifact.stage_index < from_stage)
            .map(|(name, artifact)| (name.clone(), artifact.clone()))
            .collect();
        run.stage_attempts = seed
            .stage_attempts
            .iter()
            .filter(|(stage, _)| **stage < from_stage)
            .map(|(stage, attempts)| (*stage, *attempts))
            .collect();
        run.replay_of = Some(ReplayOrigin { run_id, from_stage });

        let new_id = run.id;
        let handle = self.register(run);
        self.checkpoints.register_run(new_id).await;
        self.persist_record(&handle).await;
        self.journal
            .record(Event::new(
                new_id,
                Some(from_stage),
                EventType::RunReplayed,
                format!("Replay of run {} from stage {}", run_id, from_stage),
            ))
            .await;

        info!(source = %run_id, %new_id, from_stage, "run replayed");
        Ok(handle)
    }

    /// Handle for a run, loading it from the store after a restart.
    ///
    /// Non-terminal runs resume from their latest durable checkpoint. A run
    /// whose record survived but whose checkpoints never reached the store
    /// reports `CheckpointDegraded`.
    pub async fn recover(&self, run_id: Uuid) -> Result<Arc<RunHandle>> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle);
        }

        let record = self.checkpoints.load_run_record(run_id).await?;
        let run = if record.is_terminal()
            || record.status == RunStatus::AwaitingApproval
            || record.status == RunStatus::Pending
        {
            record
        } else {
            match self.checkpoints.load_latest(run_id).await {
                Ok(checkpoint) => {
                    let mut run: Run = serde_json::from_value(checkpoint.state)?;
                    run.checkpoint_degraded = false;
                    run
                }
                Err(OrchestratorError::NotFound(_))
                    if record.current_stage_index == 0 && record.revision == 0 =>
                {
                    record
                }
                Err(OrchestratorError::NotFound(_)) => {
                    return Err(OrchestratorError::CheckpointDegraded { run_id })
                }
                Err(e) => return Err(e),
            }
        };

        let status = run.status;
        // Finished runs are read-only; keep them out of the live set
        if status.is_terminal() {
            return Ok(Arc::new(RunHandle::new(run)));
        }

        let handle = self.register(run);
        self.journal
            .record(Event::new(
                run_id,
                Some(handle.snapshot().current_stage_index),
                EventType::RunResumed,
                format!("Run recovered in state {}", status),
            ))
            .await;
        info!(%run_id, %status, "run recovered");
        Ok(handle)
    }

    /// Current state of a run
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        if let Some(handle) = self.handle(run_id) {
            return Ok(handle.snapshot());
        }
        self.checkpoints.load_run_record(run_id).await
    }

    /// Every known run, oldest first
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        let mut ids = self.checkpoints.list_run_ids().await?;
        for id in self.runs.read().keys() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_run(id).await {
                Ok(run) => runs.push(run),
                Err(e) => debug!(run_id = %id, error = %e, "skipping unreadable run"),
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}

/// Artifact content written by an approved gate
fn decision_record(request: &ApprovalRequest) -> Value {
    json!({
        "decision": request.decision,
        "notes": request.notes,
        "decider": request.decider,
        "decided_at": request.decided_at,
        "revision": request.revision,
    })
}
