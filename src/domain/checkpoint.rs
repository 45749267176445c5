//! Checkpoint snapshots of run progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::TransportMode;

/// Immutable snapshot of a run after a stage completed.
///
/// Checkpoints of one run are strictly increasing by `(revision, stage_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,

    /// Run revision the stage completed in
    pub revision: u32,

    /// Index of the completed stage
    pub stage_index: usize,

    /// Serialized run snapshot
    pub state: Value,

    /// Transport the checkpoint was written through
    pub transport_used: TransportMode,

    pub timestamp: DateTime<Utc>,

    /// Held in process memory only
    #[serde(default)]
    pub degraded: bool,
}

impl Checkpoint {
    pub fn new(
        run_id: Uuid,
        revision: u32,
        stage_index: usize,
        state: Value,
        transport_used: TransportMode,
    ) -> Self {
        Self {
            run_id,
            revision,
            stage_index,
            state,
            transport_used,
            timestamp: Utc::now(),
            degraded: false,
        }
    }

    pub fn position(&self) -> (u32, usize) {
        (self.revision, self.stage_index)
    }
}

/// Where a checkpoint ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to the durable store
    Durable,

    /// Held in memory; a background retry is scheduled
    Degraded,
}
