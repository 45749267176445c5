//! Error taxonomy shared by every orchestrator component.
//!
//! Transport-level failures (`StoreError`, `AgentError`) are translated
//! into [`OrchestratorError`] at component boundaries; callers of the
//! controller only ever see an [`ErrorKind`] plus a readable message.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Caller-facing error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable failure (timeout, network, rate limit)
    Transient,

    /// Non-retryable task failure (bad input, policy violation)
    TerminalTask,

    /// Durable persistence failed; state is held in memory only
    CheckpointDegraded,

    /// Durable persistence failed and the fail-fast policy is active
    CheckpointFailed,

    /// No approval decision arrived within the configured wait
    ApprovalTimeout,

    /// A reviewer rejected the run
    ApprovalRejected,

    /// Referenced run, checkpoint or approval does not exist
    NotFound,

    /// The approval already carries a decision
    AlreadyDecided,

    /// The run was aborted
    Aborted,

    /// Caller supplied malformed input
    InvalidInput,

    /// Operation not allowed in the run's current state
    InvalidState,

    /// Unexpected internal failure
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::TerminalTask => "terminal_task",
            Self::CheckpointDegraded => "checkpoint_degraded",
            Self::CheckpointFailed => "checkpoint_failed",
            Self::ApprovalTimeout => "approval_timeout",
            Self::ApprovalRejected => "approval_rejected",
            Self::NotFound => "not_found",
            Self::AlreadyDecided => "already_decided",
            Self::Aborted => "aborted",
            Self::InvalidInput => "invalid_input",
            Self::InvalidState => "invalid_state",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal error type of the orchestrator core
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("task failed: {0}")]
    TerminalTask(String),

    #[error("checkpoints for run {run_id} are held in memory only and cannot be resumed")]
    CheckpointDegraded { run_id: Uuid },

    #[error("checkpoint could not be persisted: {0}")]
    CheckpointFailed(String),

    #[error("approval for run {run_id} timed out after {waited_seconds}s")]
    ApprovalTimeout { run_id: Uuid, waited_seconds: u64 },

    #[error("approval for run {run_id} was rejected{}", notes_suffix(.notes))]
    ApprovalRejected { run_id: Uuid, notes: Option<String> },

    #[error("{0} not found")]
    NotFound(String),

    #[error("approval for run {0} was already decided")]
    AlreadyDecided(Uuid),

    #[error("run {0} was aborted")]
    Aborted(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn notes_suffix(notes: &Option<String>) -> String {
    match notes {
        Some(n) if !n.is_empty() => format!(": {}", n),
        _ => String::new(),
    }
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::TerminalTask(_) => ErrorKind::TerminalTask,
            Self::CheckpointDegraded { .. } => ErrorKind::CheckpointDegraded,
            Self::CheckpointFailed(_) => ErrorKind::CheckpointFailed,
            Self::ApprovalTimeout { .. } => ErrorKind::ApprovalTimeout,
            Self::ApprovalRejected { .. } => ErrorKind::ApprovalRejected,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyDecided(_) => ErrorKind::AlreadyDecided,
            Self::Aborted(_) => ErrorKind::Aborted,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("state serialization failed: {}", e))
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let run_id = Uuid::new_v4();
        assert_eq!(
            OrchestratorError::AlreadyDecided(run_id).kind(),
            ErrorKind::AlreadyDecided
        );
        assert_eq!(
            OrchestratorError::ApprovalTimeout {
                run_id,
                waited_seconds: 10
            }
            .kind(),
            ErrorKind::ApprovalTimeout
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CheckpointDegraded).unwrap();
        assert_eq!(json, "\"checkpoint_degraded\"");
        assert_eq!(ErrorKind::TerminalTask.to_string(), "terminal_task");
    }

    #[test]
    fn test_rejection_message_includes_notes() {
        let err = OrchestratorError::ApprovalRejected {
            run_id: Uuid::nil(),
            notes: Some("tone is off".to_string()),
        };
        assert!(err.to_string().ends_with(": tone is off"));
    }
}
