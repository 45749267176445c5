//! Domain types for the stagecoach orchestrator.
//!
//! This module contains the core data structures:
//! - Run: Workflow execution state and its state machine
//! - Artifact: Stage outputs
//! - Checkpoint: Persisted progress snapshots
//! - ApprovalRequest: Human approval checkpoints
//! - Events: Audit journal entries

pub mod approval;
pub mod artifact;
pub mod checkpoint;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use approval::{ApprovalRequest, Decision};
pub use artifact::{Artifact, Artifacts};
pub use checkpoint::{Checkpoint, SaveOutcome};
pub use events::{Event, EventType};
pub use run::{ReplayOrigin, Run, RunError, RunStatus};
