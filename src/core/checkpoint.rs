//! Checkpoint repository.
//!
//! Persists run progress to the durable store through whatever transport
//! the probe selected. When the store cannot be reached the configured
//! policy decides: `degrade` keeps the checkpoint in process memory and
//! retries in the background, `fail_fast` fails the save.
//!
//! Layout:
//! - `checkpoints/<run>/<stage:06>` one checkpoint per stage
//! - `checkpoints/<run>/latest` highest checkpoint durably written
//! - `runs/<run>` latest run record
//! - `runs/index` list of run ids

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CheckpointPolicy, CheckpointSettings};
use crate::domain::{Checkpoint, Run, SaveOutcome};
use crate::error::{OrchestratorError, Result};
use crate::store::{keys, SharedStore, StoreClientFactory, StoreError, TransportMode};

type Position = (u32, usize);

#[derive(Default)]
struct RunLedger {
    /// Highest position accepted by `save`, durable or not
    high_water: Option<Position>,
    /// Position currently under `checkpoints/<run>/latest`
    durable_latest: Option<Position>,
    /// Position durably written under each stage key
    durable_stage: HashMap<usize, Position>,
    /// Degraded checkpoints not yet written durably
    pending: BTreeMap<Position, Checkpoint>,
    /// Run record not yet written durably
    pending_record: Option<Run>,
    /// Last run record accepted, durable or not
    record: Option<Run>,
    retry_scheduled: bool,
}

#[derive(Default)]
struct RunEntry {
    /// Serializes writes for one run
    writes: tokio::sync::Mutex<()>,
    ledger: Mutex<RunLedger>,
}

/// Durable checkpoints with an in-memory fallback
pub struct CheckpointRepository {
    stores: Arc<StoreClientFactory>,
    settings: CheckpointSettings,
    runs: Arc<Mutex<HashMap<Uuid, Arc<RunEntry>>>>,
    /// Run ids registered while the index was unreachable
    local_index: Mutex<Vec<Uuid>>,
}

impl CheckpointRepository {
    pub fn new(stores: Arc<StoreClientFactory>, settings: CheckpointSettings) -> Self {
        Self {
            stores,
            settings,
            runs: Arc::new(Mutex::new(HashMap::new())),
            local_index: Mutex::new(Vec::new()),
        }
    }

    fn entry(&self, run_id: Uuid) -> Arc<RunEntry> {
        Arc::clone(self.runs.lock().entry(run_id).or_default())
    }

    /// Persist the snapshot taken after `stage_index` completed.
    ///
    /// Positions `(revision, stage_index)` must strictly increase per run.
    pub async fn save(
        &self,
        run_id: Uuid,
        revision: u32,
        stage_index: usize,
        state: Value,
    ) -> Result<SaveOutcome> {
        let entry = self.entry(run_id);
        let _guard = entry.writes.lock().await;

        let position = (revision, stage_index);
        if let Some(high_water) = entry.ledger.lock().high_water {
            if position <= high_water {
                return Err(OrchestratorError::InvalidState(format!(
                    "checkpoint {:?} for run {} is not after {:?}",
                    position, run_id, high_water
                )));
            }
        }

        let store = self.stores.current().await;
        let mode = store.transport();
        let mut checkpoint = Checkpoint::new(run_id, revision, stage_index, state, mode);

        match write_checkpoint(&store, &checkpoint, true).await {
            Ok(()) => {
                self.stores.report_success(mode);
                let mut ledger = entry.ledger.lock();
                ledger.high_water = Some(position);
                ledger.durable_latest = Some(position);
                ledger.durable_stage.insert(stage_index, position);
                debug!(%run_id, revision, stage_index, transport = %mode, "checkpoint saved");
                Ok(SaveOutcome::Durable)
            }
            Err(e) => {
                self.stores.report_failure(mode);
                match self.settings.on_failure {
                    CheckpointPolicy::FailFast => {
                        warn!(%run_id, stage_index, error = %e, "checkpoint write failed");
                        Err(OrchestratorError::CheckpointFailed(format!(
                            "stage {} of run {}: {}",
                            stage_index, run_id, e
                        )))
                    }
                    CheckpointPolicy::Degrade => {
                        warn!(
                            %run_id,
                            stage_index,
                            error = %e,
                            "checkpoint held in memory, run is not resumable until flushed"
                        );
                        checkpoint.degraded = true;
                        {
                            let mut ledger = entry.ledger.lock();
                            ledger.high_water = Some(position);
                            ledger.pending.insert(position, checkpoint);
                        }
                        self.schedule_flush(run_id, &entry);
                        Ok(SaveOutcome::Degraded)
                    }
                }
            }
        }
    }

    /// Highest durably written checkpoint
    pub async fn load_latest(&self, run_id: Uuid) -> Result<Checkpoint> {
        let key = keys::latest_checkpoint(run_id);
        let value = self.get(&key).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Checkpoint for one stage, durable first, then this process's memory
    pub async fn load_at(&self, run_id: Uuid, stage_index: usize) -> Result<Checkpoint> {
        let key = keys::checkpoint(run_id, stage_index);
        let durable = match self.get(&key).await {
            Ok(value) => Some(serde_json::from_value::<Checkpoint>(value)?),
            Err(OrchestratorError::NotFound(_)) | Err(OrchestratorError::Transient(_)) => None,
            Err(e) => return Err(e),
        };

        let in_memory = self.runs.lock().get(&run_id).and_then(|entry| {
            entry
                .ledger
                .lock()
                .pending
                .values()
                .rev()
                .find(|c| c.stage_index == stage_index)
                .cloned()
        });

        // A pending checkpoint is newer than whatever the store holds
        match (durable, in_memory) {
            (Some(d), Some(m)) if m.position() > d.position() => Ok(m),
            (Some(d), _) => Ok(d),
            (None, Some(m)) => Ok(m),
            (None, None) => Err(OrchestratorError::NotFound(format!(
                "checkpoint {} of run {}",
                stage_index, run_id
            ))),
        }
    }

    /// Persist the run record. Terminal records are never overwritten.
    pub async fn save_run_record(&self, run: &Run) -> Result<SaveOutcome> {
        let tracked = self.runs.lock().contains_key(&run.id);
        if !tracked && !run.is_terminal() {
            if let Ok(value) = self.get(&keys::run_record(run.id)).await {
                if serde_json::from_value::<Run>(value).map_or(false, |r| r.is_terminal()) {
                    debug!(run_id = %run.id, "durable run record already terminal, skipping");
                    return Ok(SaveOutcome::Durable);
                }
            }
        }

        let entry = self.entry(run.id);
        let _guard = entry.writes.lock().await;

        {
            let mut ledger = entry.ledger.lock();
            if let Some(existing) = &ledger.record {
                if existing.is_terminal() {
                    debug!(run_id = %run.id, status = %run.status, "run record already terminal, skipping");
                    return Ok(if ledger.pending_record.is_some() {
                        SaveOutcome::Degraded
                    } else {
                        SaveOutcome::Durable
                    });
                }
            }
            ledger.record = Some(run.clone());
        }

        let store = self.stores.current().await;
        let mode = store.transport();
        let value = serde_json::to_value(run)?;

        match store.put(&keys::run_record(run.id), &value).await {
            Ok(()) => {
                self.stores.report_success(mode);
                entry.ledger.lock().pending_record = None;
                Ok(SaveOutcome::Durable)
            }
            Err(e) => {
                self.stores.report_failure(mode);
                match self.settings.on_failure {
                    CheckpointPolicy::FailFast => Err(OrchestratorError::CheckpointFailed(
                        format!("run record {}: {}", run.id, e),
                    )),
                    CheckpointPolicy::Degrade => {
                        warn!(run_id = %run.id, error = %e, "run record held in memory");
                        entry.ledger.lock().pending_record = Some(run.clone());
                        self.schedule_flush(run.id, &entry);
                        Ok(SaveOutcome::Degraded)
                    }
                }
            }
        }
    }

    /// Latest run record, durable first, then this process's memory
    pub async fn load_run_record(&self, run_id: Uuid) -> Result<Run> {
        let in_memory = self
            .runs
            .lock()
            .get(&run_id)
            .and_then(|entry| entry.ledger.lock().record.clone());
        if let Some(run) = in_memory {
            return Ok(run);
        }

        let value = self.get(&keys::run_record(run_id)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Add a run id to the durable index
    pub async fn register_run(&self, run_id: Uuid) {
        let store = self.stores.current().await;
        let mode = store.transport();
        match store.append(keys::RUN_INDEX, &Value::String(run_id.to_string())).await {
            Ok(()) => self.stores.report_success(mode),
            Err(e) => {
                self.stores.report_failure(mode);
                warn!(%run_id, error = %e, "run index unavailable, keeping run id locally");
                self.local_index.lock().push(run_id);
            }
        }
    }

    /// Every known run id, oldest first
    pub async fn list_run_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids = match self.get(keys::RUN_INDEX).await {
            Ok(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect(),
            Ok(_) => Vec::new(),
            Err(OrchestratorError::NotFound(_)) => Vec::new(),
            Err(OrchestratorError::Transient(e)) => {
                warn!(error = %e, "run index unavailable, listing local runs only");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        for id in self.local_index.lock().iter() {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        Ok(ids)
    }

    /// True while any checkpoint or record of the run is memory-only
    pub fn is_degraded(&self, run_id: Uuid) -> bool {
        self.runs.lock().get(&run_id).map_or(false, |entry| {
            let ledger = entry.ledger.lock();
            !ledger.pending.is_empty() || ledger.pending_record.is_some()
        })
    }

    /// Forget a finished run once nothing of it is memory-only.
    ///
    /// Returns false while the run is unfinished or a flush is still owed;
    /// a successful flush releases a finished run itself.
    pub fn release(&self, run_id: Uuid) -> bool {
        release_settled(&self.runs, run_id)
    }

    /// Number of runs with state held in this process
    pub fn tracked_runs(&self) -> usize {
        self.runs.lock().len()
    }

    /// Try once to write every pending checkpoint and record of a run.
    ///
    /// Returns how many items remain memory-only.
    pub async fn flush_pending(&self, run_id: Uuid) -> usize {
        let Some(entry) = self.runs.lock().get(&run_id).cloned() else {
            return 0;
        };
        let remaining = flush_entry(&self.stores, run_id, &entry).await;
        if remaining == 0 {
            release_settled(&self.runs, run_id);
        }
        remaining
    }

    fn schedule_flush(&self, run_id: Uuid, entry: &Arc<RunEntry>) {
        {
            let mut ledger = entry.ledger.lock();
            if ledger.retry_scheduled {
                return;
            }
            ledger.retry_scheduled = true;
        }

        let stores = Arc::clone(&self.stores);
        let runs = Arc::clone(&self.runs);
        let entry = Arc::clone(entry);
        let attempts = self.settings.retry_attempts;
        let policy = self.settings.retry.clone();

        tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(policy.jittered_delay(attempt)).await;

                let remaining = flush_entry(&stores, run_id, &entry).await;
                if remaining == 0 {
                    info!(%run_id, attempt, "degraded checkpoints flushed to the durable store");
                    entry.ledger.lock().retry_scheduled = false;
                    release_settled(&runs, run_id);
                    return;
                }
                debug!(%run_id, attempt, remaining, "checkpoint flush incomplete");
            }

            let mut ledger = entry.ledger.lock();
            ledger.retry_scheduled = false;
            // A finished run is never resumed; only its record is still needed
            if ledger.record.as_ref().map_or(false, Run::is_terminal) && !ledger.pending.is_empty() {
                warn!(
                    %run_id,
                    attempts,
                    dropped = ledger.pending.len(),
                    "giving up on flushing degraded checkpoints of a finished run"
                );
                ledger.pending.clear();
            } else {
                warn!(%run_id, attempts, "giving up on flushing degraded checkpoints");
            }
        });
    }

    async fn get(&self, key: &str) -> Result<Value> {
        let store = self.stores.current().await;
        let mode = store.transport();
        match store.get(key).await {
            Ok(value) => {
                self.stores.report_success(mode);
                Ok(value)
            }
            Err(StoreError::NotFound(key)) => {
                self.stores.report_success(mode);
                Err(OrchestratorError::NotFound(key))
            }
            Err(e) => {
                self.stores.report_failure(mode);
                Err(translate(e))
            }
        }
    }
}

/// Put the stage key, then move `latest` when asked
async fn write_checkpoint(
    store: &SharedStore,
    checkpoint: &Checkpoint,
    advance_latest: bool,
) -> std::result::Result<(), StoreError> {
    let mut durable = checkpoint.clone();
    durable.degraded = false;
    durable.transport_used = store.transport();

    let value = serde_json::to_value(&durable).map_err(|e| StoreError::Codec(e.to_string()))?;
    store
        .put(&keys::checkpoint(checkpoint.run_id, checkpoint.stage_index), &value)
        .await?;
    if advance_latest {
        store
            .put(&keys::latest_checkpoint(checkpoint.run_id), &value)
            .await?;
    }
    Ok(())
}

async fn flush_entry(stores: &StoreClientFactory, run_id: Uuid, entry: &RunEntry) -> usize {
    let _guard = entry.writes.lock().await;

    let (pending, record, durable_latest, mut durable_stage) = {
        let ledger = entry.ledger.lock();
        (
            ledger.pending.values().cloned().collect::<Vec<_>>(),
            ledger.pending_record.clone(),
            ledger.durable_latest,
            ledger.durable_stage.clone(),
        )
    };
    if pending.is_empty() && record.is_none() {
        return 0;
    }

    let store = stores.current().await;
    let mode = store.transport();
    if mode == TransportMode::Degraded {
        let ledger = entry.ledger.lock();
        return ledger.pending.len() + usize::from(ledger.pending_record.is_some());
    }

    let mut latest = durable_latest;
    for checkpoint in pending {
        let position = checkpoint.position();
        let stage_index = checkpoint.stage_index;

        // A later revision already owns this stage key
        if durable_stage.get(&stage_index).map_or(false, |d| *d >= position) {
            debug!(%run_id, ?position, "dropping superseded degraded checkpoint");
            entry.ledger.lock().pending.remove(&position);
            continue;
        }

        let advance = latest.map_or(true, |l| position > l);
        if let Err(e) = write_checkpoint(&store, &checkpoint, advance).await {
            stores.report_failure(mode);
            debug!(%run_id, error = %e, "checkpoint flush failed");
            break;
        }
        stores.report_success(mode);

        let mut ledger = entry.ledger.lock();
        ledger.pending.remove(&position);
        ledger.durable_stage.insert(stage_index, position);
        durable_stage.insert(stage_index, position);
        if advance {
            latest = Some(position);
            ledger.durable_latest = Some(position);
        }
    }

    let checkpoints_done = entry.ledger.lock().pending.is_empty();
    if checkpoints_done {
        if let Some(run) = record {
            match serde_json::to_value(&run) {
                Ok(value) => match store.put(&keys::run_record(run_id), &value).await {
                    Ok(()) => {
                        let mut ledger = entry.ledger.lock();
                        // A newer record may have been queued meanwhile
                        if ledger.pending_record.as_ref() == Some(&run) {
                            ledger.pending_record = None;
                        }
                    }
                    Err(e) => {
                        stores.report_failure(mode);
                        debug!(%run_id, error = %e, "run record flush failed");
                    }
                },
                Err(e) => warn!(%run_id, error = %e, "run record could not be serialized"),
            }
        }
    }

    let ledger = entry.ledger.lock();
    ledger.pending.len() + usize::from(ledger.pending_record.is_some())
}

/// Drop a run whose record is terminal and fully durable
fn release_settled(runs: &Mutex<HashMap<Uuid, Arc<RunEntry>>>, run_id: Uuid) -> bool {
    let mut runs = runs.lock();
    let settled = runs.get(&run_id).map_or(true, |entry| {
        let ledger = entry.ledger.lock();
        ledger.pending.is_empty()
            && ledger.pending_record.is_none()
            && ledger.record.as_ref().map_or(false, Run::is_terminal)
    });
    if settled {
        runs.remove(&run_id);
    }
    settled
}

/// Map a store failure onto the orchestrator taxonomy
pub(crate) fn translate(error: StoreError) -> OrchestratorError {
    match error {
        StoreError::NotFound(key) => OrchestratorError::NotFound(key),
        StoreError::Timeout(_) | StoreError::Unavailable(_) => {
            OrchestratorError::Transient(error.to_string())
        }
        StoreError::Rejected(_) | StoreError::Codec(_) => {
            OrchestratorError::Internal(error.to_string())
        }
    }
}
