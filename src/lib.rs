//! stagecoach - checkpointed multi-stage agent workflow orchestrator
//!
//! Coordinates task-executing agents through a staged workflow with human
//! approval gates, persisting progress to a durable store reached over an
//! unreliable network.
//!
//! # Architecture
//!
//! - Every completed stage writes a checkpoint; checkpoints are strictly
//!   ordered per run and the latest one is authoritative for resume
//! - The store transport (binary or HTTP/JSON) is chosen by a bounded
//!   probe; when neither is reachable runs continue on in-memory
//!   checkpoints and are flagged as degraded
//! - A run paused at an approval gate is persisted state, not a parked
//!   task, so the process can restart while it waits
//!
//! # Modules
//!
//! - `agents`: Agent seam and the command-backed agent
//! - `core`: Probe, checkpoints, executor, approval gate, orchestrator
//! - `store`: Durable store transports and the client factory
//! - `domain`: Data structures (Run, Artifact, Checkpoint, Event)
//! - `controller`: Caller-facing API
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a run
//! stagecoach start brandX --params '{"period": "2024-11"}'
//!
//! # Approve the paused run
//! stagecoach approve <run-id> --decision approve
//!
//! # Resume after a restart
//! stagecoach resume <run-id>
//! ```

pub mod agents;
pub mod cli;
pub mod config;
pub mod controller;
pub mod core;
pub mod domain;
pub mod error;
pub mod store;

// Re-export main types at crate root for convenience
pub use controller::{ApiError, RunController, RunView};
pub use core::{Orchestrator, Workflow};
pub use domain::{ApprovalRequest, Decision, Event, EventType, Run, RunStatus};
pub use error::{ErrorKind, OrchestratorError};
