//! Journal events for the run audit trail.
//!
//! Every lifecycle change and every executor attempt is appended to a
//! per-run journal so a run can be audited or replayed by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a run's append-only journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage index (if applicable)
    pub stage_index: Option<usize>,

    /// Type of event
    pub event_type: EventType,

    /// Invocation key handed to the agent (empty for run-level events)
    #[serde(default)]
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Executor attempt number (1-based)
    pub attempt: Option<u32>,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage_index: Option<usize>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage_index,
            event_type,
            idempotency_key: String::new(),
            summary: summary.into(),
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of journal events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunResumed,
    RunReplayed,
    RunCompleted,
    RunFailed,
    RunAborted,
    StageStarted,
    StageCompleted,
    AttemptSucceeded,
    AttemptFailed,
    CheckpointSaved,
    CheckpointDegraded,
    ApprovalRequested,
    ApprovalDecided,
    ApprovalExpired,
    RunRevised,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            Uuid::new_v4(),
            Some(0),
            EventType::AttemptFailed,
            "researcher attempt 1 failed",
        )
        .with_attempt(1)
        .with_error("connection reset");

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::AttemptFailed);
        assert_eq!(parsed.attempt, Some(1));
        assert_eq!(parsed.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_event_with_duration() {
        let event = Event::new(Uuid::new_v4(), Some(2), EventType::StageCompleted, "done")
            .with_duration(1500);

        assert_eq!(event.duration_ms, Some(1500));
    }
}
