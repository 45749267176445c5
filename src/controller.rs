//! Run controller: the caller-facing API.
//!
//! Validates caller input, spawns one driver task per run and translates
//! internal errors into [`ApiError`]. Everything below this layer works
//! with typed ids and [`OrchestratorError`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::config::Settings;
use crate::core::{
    ApprovalGate, CheckpointRepository, Journal, Orchestrator, RunHandle, TaskExecutor,
    TransportDecision, Workflow,
};
use crate::domain::{ApprovalRequest, Artifacts, Decision, Event, ReplayOrigin, Run, RunError, RunStatus};
use crate::error::{ErrorKind, OrchestratorError};
use crate::store::StoreClientFactory;

const MAX_SUBJECT_KEY_LEN: usize = 128;

/// Error returned to callers of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Caller view of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub subject_key: String,
    pub status: RunStatus,
    /// Name of the next stage to execute; `None` once past the last stage
    pub current_stage: Option<String>,
    pub current_stage_index: usize,
    pub revision: u32,
    pub artifacts: Artifacts,
    pub error: Option<RunError>,
    pub checkpoint_degraded: bool,
    pub replay_of: Option<ReplayOrigin>,
    /// Request the run is waiting on, if any
    pub approval: Option<ApprovalRequest>,
}

impl RunView {
    fn new(run: Run, workflow: &Workflow, approval: Option<ApprovalRequest>) -> Self {
        let current_stage = workflow
            .stages
            .get(run.current_stage_index)
            .map(|s| s.name.clone());
        let approval = approval.filter(|_| run.status == RunStatus::AwaitingApproval);

        Self {
            run_id: run.id,
            subject_key: run.subject_key,
            status: run.status,
            current_stage,
            current_stage_index: run.current_stage_index,
            revision: run.revision,
            artifacts: run.artifacts,
            error: run.error,
            checkpoint_degraded: run.checkpoint_degraded,
            replay_of: run.replay_of,
            approval,
        }
    }
}

/// Caller-facing entry point owning the orchestrator
#[derive(Clone)]
pub struct RunController {
    orchestrator: Arc<Orchestrator>,
    stores: Arc<StoreClientFactory>,
    shutdown: CancellationToken,
}

impl RunController {
    /// Wire every component from resolved settings
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let workflow = Workflow::from_file(&settings.workflow_path)?;
        let agents = AgentRegistry::from_specs(&settings.agents);
        let stores = Arc::new(StoreClientFactory::from_settings(&settings.store, &settings.probe)?);
        Self::new(settings, workflow, agents, stores)
    }

    /// Wire the controller around an explicit workflow, agent set and store
    pub fn new(
        settings: &Settings,
        workflow: Workflow,
        agents: AgentRegistry,
        stores: Arc<StoreClientFactory>,
    ) -> anyhow::Result<Self> {
        workflow.validate()?;
        workflow.validate_agents(&agents)?;

        let journal = if settings.journal {
            Journal::new(settings.runs_dir())
        } else {
            Journal::disabled()
        };

        let checkpoints = Arc::new(CheckpointRepository::new(
            Arc::clone(&stores),
            settings.checkpoint.clone(),
        ));
        let gate = Arc::new(ApprovalGate::new(Arc::clone(&stores), settings.approval.max_wait()));
        let executor = TaskExecutor::new(
            Arc::new(agents),
            settings.execution.retry.clone(),
            journal.clone(),
        );

        let orchestrator = Orchestrator::new(
            Arc::new(workflow),
            settings.execution.clone(),
            executor,
            checkpoints,
            gate,
            journal,
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            stores,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn workflow(&self) -> &Workflow {
        self.orchestrator.workflow()
    }

    /// Create a run and start driving it in the background
    pub async fn start_run(&self, subject_key: &str, params: Value) -> ApiResult<Uuid> {
        validate_subject_key(subject_key)?;
        if !params.is_object() {
            return Err(ApiError::invalid_input("params must be a JSON object"));
        }

        let handle = self.orchestrator.create_run(subject_key, params).await?;
        let run_id = handle.id();
        self.spawn_drive(handle);

        Ok(run_id)
    }

    pub async fn get_run(&self, run_id: &str) -> ApiResult<RunView> {
        let run_id = parse_run_id(run_id)?;
        self.view(run_id).await
    }

    /// Record a reviewer decision and resume the run on approve or revise
    pub async fn submit_approval(
        &self,
        run_id: &str,
        decision: &str,
        notes: Option<String>,
        decider: Option<String>,
        revise_to: Option<usize>,
    ) -> ApiResult<ApprovalRequest> {
        let run_id = parse_run_id(run_id)?;
        let decision: Decision = decision.parse().map_err(ApiError::invalid_input)?;
        if revise_to.is_some() && decision != Decision::Revise {
            return Err(ApiError::invalid_input(
                "a revise target is only accepted with a revise decision",
            ));
        }

        let decided = self
            .orchestrator
            .decide(run_id, decision, notes, decider, revise_to)
            .await?;

        if matches!(decided.decision, Decision::Approved | Decision::Revise) {
            if let Some(handle) = self.orchestrator.handle(run_id) {
                self.spawn_drive(handle);
            }
        }

        Ok(decided)
    }

    pub async fn abort_run(&self, run_id: &str) -> ApiResult<RunView> {
        let run_id = parse_run_id(run_id)?;
        self.orchestrator.abort(run_id).await?;
        self.view(run_id).await
    }

    /// Start a new run re-executing `run_id` from `from_stage`
    pub async fn replay_run(&self, run_id: &str, from_stage: usize) -> ApiResult<Uuid> {
        let run_id = parse_run_id(run_id)?;
        let handle = self.orchestrator.replay(run_id, from_stage).await?;
        let new_id = handle.id();
        self.spawn_drive(handle);
        Ok(new_id)
    }

    /// Reload a run after a restart and resume it if it is not settled
    pub async fn recover_run(&self, run_id: &str) -> ApiResult<RunView> {
        let run_id = parse_run_id(run_id)?;
        let handle = self.orchestrator.recover(run_id).await?;

        if !handle.status().is_terminal() {
            self.spawn_drive(handle);
        }
        self.view(run_id).await
    }

    /// Every known run, oldest first
    pub async fn list_runs(&self) -> ApiResult<Vec<RunView>> {
        let workflow = self.orchestrator.workflow();
        let runs = self.orchestrator.list_runs().await?;

        let mut views = Vec::with_capacity(runs.len());
        for run in runs {
            let approval = self.orchestrator.gate().get(run.id).await;
            views.push(RunView::new(run, workflow, approval));
        }
        Ok(views)
    }

    /// Wait until the run completes, fails, is aborted or pauses for approval
    pub async fn wait_settled(&self, run_id: &str, timeout: Duration) -> ApiResult<RunView> {
        let run_id = parse_run_id(run_id)?;
        let handle = self.orchestrator.recover(run_id).await?;

        let mut status = handle.subscribe();
        let settled = tokio::time::timeout(timeout, status.wait_for(|s| s.is_settled()))
            .await
            .map(|changed| changed.is_ok());
        match settled {
            Ok(true) => {}
            // Sender lives in the handle; closing means the handle is gone
            Ok(false) => debug!(%run_id, "status channel closed"),
            Err(_) => {
                return Err(ApiError::new(
                    ErrorKind::Transient,
                    format!(
                        "run {} did not settle within {}s (status: {})",
                        run_id,
                        timeout.as_secs(),
                        handle.status()
                    ),
                ))
            }
        }

        self.view(run_id).await
    }

    /// Expire every approval past its deadline; returns the failed runs
    pub async fn sweep_expired_approvals(&self) -> Vec<Uuid> {
        let expired = self.orchestrator.sweep_expired(Utc::now()).await;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired pending approvals");
        }
        expired
    }

    /// Periodically sweep expired approvals until [`shutdown`](Self::shutdown)
    pub fn spawn_expiry_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = controller.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        controller.sweep_expired_approvals().await;
                    }
                }
            }
            debug!("expiry reaper stopped");
        })
    }

    /// Stop background tasks owned by the controller
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Current transport decision; `None` for the memory backend
    pub async fn transport(&self) -> Option<TransportDecision> {
        self.stores.decision().await
    }

    /// Journal entries recorded for a run
    pub async fn history(&self, run_id: &str) -> ApiResult<Vec<Event>> {
        let run_id = parse_run_id(run_id)?;
        let journal = self.orchestrator.journal();
        if !journal.is_enabled() {
            return Err(ApiError::new(
                ErrorKind::InvalidState,
                "journal is disabled in settings",
            ));
        }
        journal
            .replay(run_id)
            .await
            .map_err(|e| ApiError::new(ErrorKind::Internal, format!("{:#}", e)))
    }

    async fn view(&self, run_id: Uuid) -> ApiResult<RunView> {
        let run = self.orchestrator.get_run(run_id).await?;
        let approval = self.orchestrator.gate().get(run_id).await;
        Ok(RunView::new(run, self.orchestrator.workflow(), approval))
    }

    fn spawn_drive(&self, handle: Arc<RunHandle>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            let run_id = handle.id();
            match orchestrator.drive(handle).await {
                Ok(run) => debug!(%run_id, status = %run.status, "driver finished"),
                Err(e) => error!(%run_id, error = %e, "driver failed"),
            }
        })
    }
}

fn parse_run_id(value: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| ApiError::invalid_input(format!("'{}' is not a valid run id", value)))
}

fn validate_subject_key(key: &str) -> ApiResult<()> {
    if key.is_empty() || key.len() > MAX_SUBJECT_KEY_LEN {
        return Err(ApiError::invalid_input(format!(
            "subject key must be 1 to {} characters",
            MAX_SUBJECT_KEY_LEN
        )));
    }

    if let Some(bad) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        warn!(subject_key = key, "rejected subject key");
        return Err(ApiError::invalid_input(format!(
            "subject key contains invalid character '{}'",
            bad
        )));
    }

    Ok(())
}
