//! Core orchestration logic.
//!
//! This module contains:
//! - Probe: Transport selection for the durable store
//! - Checkpoint: Ordered, durable run progress
//! - Executor: Budgeted agent invocation with retries
//! - Approval: Human decision gate
//! - Stages: Workflow definitions and loading
//! - Journal: Append-only per-run audit log
//! - Orchestrator: Main execution engine

pub mod approval;
pub mod checkpoint;
pub mod executor;
pub mod journal;
pub mod orchestrator;
pub mod probe;
pub mod retry;
pub mod stages;

// Re-export commonly used types
pub use approval::ApprovalGate;
pub use checkpoint::CheckpointRepository;
pub use executor::{invocation_key, Budget, ExecutionError, ExecutionReport, ExecutionScope, TaskExecutor};
pub use journal::Journal;
pub use orchestrator::{Orchestrator, RunHandle};
pub use probe::{ConnectivityChecks, LiveChecks, ProbeReport, ProbeTarget, TransportDecision, TransportProbe};
pub use retry::RetryPolicy;
pub use stages::{Stage, StageKind, Workflow};
