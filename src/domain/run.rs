//! Run state and its transition rules.
//!
//! A Run represents a single execution of the workflow for one subject.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::artifact::{Artifact, Artifacts};
use crate::error::{ErrorKind, OrchestratorError};

/// A workflow execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Subject the run is for (e.g. a brand key)
    pub subject_key: String,

    /// Parameters supplied at start, available to stages as `params`
    pub params: Value,

    /// Current status of the run
    pub status: RunStatus,

    /// Index of the next stage to execute
    pub current_stage_index: usize,

    /// Incremented every time a reviewer sends the run back for revision
    #[serde(default)]
    pub revision: u32,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// Last state change
    pub updated_at: DateTime<Utc>,

    /// When the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,

    /// Failure details for failed or aborted runs
    pub error: Option<RunError>,

    /// Artifacts produced so far
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Set when this run was spawned by a replay
    pub replay_of: Option<ReplayOrigin>,

    /// True while some checkpoint is held in memory only
    #[serde(default)]
    pub checkpoint_degraded: bool,

    /// Executor attempts per stage index
    #[serde(default)]
    pub stage_attempts: BTreeMap<usize, u32>,
}

impl Run {
    /// Create a new pending run
    pub fn new(id: Uuid, subject_key: String, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            subject_key,
            params,
            status: RunStatus::Pending,
            current_stage_index: 0,
            revision: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            artifacts: Artifacts::new(),
            replay_of: None,
            checkpoint_degraded: false,
            stage_attempts: BTreeMap::new(),
        }
    }

    /// Move to a new status, enforcing the run state machine
    pub fn transition(&mut self, to: RunStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidState(format!(
                "run {} cannot move from {} to {}",
                self.id, self.status, to
            )));
        }

        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Mark the run failed with error details attached
    pub fn fail(
        &mut self,
        kind: ErrorKind,
        stage_index: Option<usize>,
        message: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(RunError {
            kind,
            stage_index,
            message: message.into(),
        });
        Ok(())
    }

    /// Record an artifact produced by a stage
    pub fn insert_artifact(&mut self, artifact: Artifact) {
        self.updated_at = Utc::now();
        self.artifacts.insert(artifact.name.clone(), artifact);
    }

    /// Drop every artifact produced at or after `stage_index`
    pub fn discard_artifacts_from(&mut self, stage_index: usize) {
        self.artifacts.retain(|_, a| a.stage_index < stage_index);
    }

    /// Position used to order checkpoints and progress
    pub fn position(&self) -> (u32, usize) {
        (self.revision, self.current_stage_index)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Failure details attached to a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub stage_index: Option<usize>,
    pub message: String,
}

/// Where a replayed run came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOrigin {
    pub run_id: Uuid,
    pub from_stage: usize,
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet driven
    Pending,

    /// Currently executing stages
    Running,

    /// Paused at an approval gate
    AwaitingApproval,

    /// Completed successfully
    Completed,

    /// Failed with error
    Failed,

    /// Aborted by a caller
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Terminal or waiting on an external decision
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, Self::AwaitingApproval)
    }

    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        match (self, to) {
            (Pending, Running | Failed | Aborted) => true,
            (Running, Running | AwaitingApproval | Completed | Failed | Aborted) => true,
            (AwaitingApproval, Running | Failed | Aborted) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
