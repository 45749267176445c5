//! Approval gate: human decisions on paused runs.
//!
//! Each run has at most one active request. The pending check and the
//! decision write happen under the run's slot lock, so of two concurrent
//! decisions exactly one wins and the other sees `AlreadyDecided`.
//!
//! Requests are mirrored to `approvals/<run_id>` so a paused run survives a
//! restart. A failed mirror write is logged; callers never see it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{ApprovalRequest, Decision};
use crate::error::{OrchestratorError, Result};
use crate::store::{keys, StoreClientFactory};

use super::checkpoint::translate;

type Slot = Arc<Mutex<Option<ApprovalRequest>>>;

pub struct ApprovalGate {
    stores: Arc<StoreClientFactory>,
    max_wait: chrono::Duration,
    slots: parking_lot::Mutex<HashMap<Uuid, Slot>>,
}

impl ApprovalGate {
    pub fn new(stores: Arc<StoreClientFactory>, max_wait: std::time::Duration) -> Self {
        let max_wait = chrono::Duration::from_std(max_wait).unwrap_or_else(|_| chrono::Duration::days(7));
        Self {
            stores,
            max_wait,
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, run_id: Uuid) -> Slot {
        Arc::clone(self.slots.lock().entry(run_id).or_default())
    }

    /// Open a request for the given stage pass.
    ///
    /// Returns the existing request unchanged while it is still pending for
    /// the same pass.
    pub async fn request(
        &self,
        run_id: Uuid,
        revision: u32,
        stage_index: usize,
        summary: String,
    ) -> ApprovalRequest {
        let slot = self.slot(run_id);
        let mut current = slot.lock().await;

        if let Some(existing) = current.as_ref() {
            if existing.is_pending() && existing.matches(revision, stage_index) {
                return existing.clone();
            }
            if existing.is_pending() {
                warn!(
                    %run_id,
                    stale_stage = existing.stage_index,
                    stale_revision = existing.revision,
                    "replacing stale pending approval"
                );
            }
        }

        let request = ApprovalRequest::new(run_id, revision, stage_index, summary, self.max_wait);
        self.persist(&request).await;
        info!(%run_id, stage_index, revision, expires_at = %request.expires_at, "approval requested");

        *current = Some(request.clone());
        request
    }

    /// Record a reviewer's decision.
    ///
    /// `revise_to` is required for `Revise` and must name an earlier stage.
    pub async fn decide(
        &self,
        run_id: Uuid,
        decision: Decision,
        notes: Option<String>,
        decider: Option<String>,
        revise_to: Option<usize>,
    ) -> Result<ApprovalRequest> {
        if matches!(decision, Decision::Pending | Decision::Expired) {
            return Err(OrchestratorError::InvalidInput(format!(
                "'{}' is not a reviewer decision",
                decision
            )));
        }

        let slot = self.slot(run_id);
        let mut current = slot.lock().await;
        if current.is_none() {
            *current = self.fetch(run_id).await?;
        }

        let request = current
            .as_mut()
            .ok_or_else(|| OrchestratorError::NotFound(format!("approval for run {}", run_id)))?;

        match request.decision {
            Decision::Pending => {}
            Decision::Expired => {
                return Err(OrchestratorError::ApprovalTimeout {
                    run_id,
                    waited_seconds: request.max_wait_seconds(),
                })
            }
            _ => return Err(OrchestratorError::AlreadyDecided(run_id)),
        }

        let now = Utc::now();
        if request.is_expired_at(now) {
            request.decision = Decision::Expired;
            request.decided_at = Some(now);
            let expired = request.clone();
            self.persist(&expired).await;
            return Err(OrchestratorError::ApprovalTimeout {
                run_id,
                waited_seconds: expired.max_wait_seconds(),
            });
        }

        if decision == Decision::Revise {
            match revise_to {
                Some(target) if target < request.stage_index => {}
                Some(target) => {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "revise target {} is not before approval stage {}",
                        target, request.stage_index
                    )))
                }
                None => {
                    return Err(OrchestratorError::InvalidInput(
                        "revise requires a target stage".to_string(),
                    ))
                }
            }
        }

        request.decision = decision;
        request.notes = notes;
        request.decider = decider;
        request.decided_at = Some(now);
        request.revise_to = if decision == Decision::Revise { revise_to } else { None };

        let decided = request.clone();
        self.persist(&decided).await;
        info!(%run_id, decision = %decision, decider = ?decided.decider, "approval decided");

        Ok(decided)
    }

    /// Request currently held in memory
    pub async fn get(&self, run_id: Uuid) -> Option<ApprovalRequest> {
        let slot = self.slots.lock().get(&run_id).cloned()?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Request for a run, rehydrating from the store after a restart
    pub async fn load(&self, run_id: Uuid) -> Result<ApprovalRequest> {
        let slot = self.slot(run_id);
        let mut current = slot.lock().await;
        if current.is_none() {
            *current = self.fetch(run_id).await?;
        }

        current
            .clone()
            .ok_or_else(|| OrchestratorError::NotFound(format!("approval for run {}", run_id)))
    }

    /// Forget the request of a finished run; `load` refetches it if asked
    pub fn release(&self, run_id: Uuid) {
        self.slots.lock().remove(&run_id);
    }

    /// Pending requests past their expiry at `now`
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();

        let mut expired = Vec::new();
        for slot in slots {
            if let Some(request) = slot.lock().await.as_ref() {
                if request.is_expired_at(now) {
                    expired.push(request.clone());
                }
            }
        }
        expired.sort_by_key(|r| r.expires_at);
        expired
    }

    /// Mark a pending request expired
    pub async fn expire(&self, run_id: Uuid) -> Result<ApprovalRequest> {
        let slot = self.slot(run_id);
        let mut current = slot.lock().await;
        if current.is_none() {
            *current = self.fetch(run_id).await?;
        }

        let request = current
            .as_mut()
            .ok_or_else(|| OrchestratorError::NotFound(format!("approval for run {}", run_id)))?;
        if !request.is_pending() {
            return Err(OrchestratorError::AlreadyDecided(run_id));
        }

        request.decision = Decision::Expired;
        request.decided_at = Some(Utc::now());
        let expired = request.clone();
        self.persist(&expired).await;
        warn!(%run_id, stage_index = expired.stage_index, "approval expired");

        Ok(expired)
    }

    async fn persist(&self, request: &ApprovalRequest) {
        let value = match serde_json::to_value(request) {
            Ok(value) => value,
            Err(e) => {
                warn!(run_id = %request.run_id, error = %e, "approval could not be serialized");
                return;
            }
        };

        let store = self.stores.current().await;
        let mode = store.transport();
        match store.put(&keys::approval(request.run_id), &value).await {
            Ok(()) => self.stores.report_success(mode),
            Err(e) => {
                self.stores.report_failure(mode);
                warn!(run_id = %request.run_id, error = %e, "approval held in memory only");
            }
        }
    }

    async fn fetch(&self, run_id: Uuid) -> Result<Option<ApprovalRequest>> {
        let store = self.stores.current().await;
        match store.get(&keys::approval(run_id)).await {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                self.stores.report_failure(store.transport());
                Err(translate(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn gate(max_wait: Duration) -> ApprovalGate {
        ApprovalGate::new(
            Arc::new(StoreClientFactory::fixed(Arc::new(MemoryStore::new()))),
            max_wait,
        )
    }

    #[tokio::test]
    async fn test_request_is_idempotent_while_pending() {
        let gate = gate(Duration::from_secs(3600));
        let run_id = Uuid::new_v4();

        let first = gate.request(run_id, 0, 1, "review research".to_string()).await;
        let second = gate.request(run_id, 0, 1, "different summary".to_string()).await;

        assert_eq!(first, second);
        assert_eq!(second.summary, "review research");
    }

    #[tokio::test]
    async fn test_second_decision_is_rejected() {
        let gate = gate(Duration::from_secs(3600));
        let run_id = Uuid::new_v4();
        gate.request(run_id, 0, 1, "review".to_string()).await;

        let decided = gate
            .decide(run_id, Decision::Approved, Some("ship it".into()), Some("ana".into()), None)
            .await
            .unwrap();
        assert_eq!(decided.decision, Decision::Approved);
        assert!(decided.decided_at.is_some());

        let err = gate
            .decide(run_id, Decision::Rejected, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDecided);

        // First decision stands
        assert_eq!(gate.get(run_id).await.unwrap().decision, Decision::Approved);
    }

    #[tokio::test]
    async fn test_released_slot_reloads_decision_from_store() {
        let gate = gate(Duration::from_secs(3600));
        let run_id = Uuid::new_v4();
        gate.request(run_id, 0, 1, "review".to_string()).await;
        gate.decide(run_id, Decision::Rejected, None, None, None)
            .await
            .unwrap();

        gate.release(run_id);
        assert!(gate.slots.lock().is_empty());

        let err = gate
            .decide(run_id, Decision::Approved, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyDecided);
        assert_eq!(gate.get(run_id).await.unwrap().decision, Decision::Rejected);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let gate = gate(Duration::from_secs(3600));
        let err = gate
            .decide(Uuid::new_v4(), Decision::Approved, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_revise_target_must_be_earlier() {
        let gate = gate(Duration::from_secs(3600));
        let run_id = Uuid::new_v4();
        gate.request(run_id, 0, 2, "review".to_string()).await;

        let err = gate
            .decide(run_id, Decision::Revise, None, None, Some(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let decided = gate
            .decide(run_id, Decision::Revise, Some("redo".into()), None, Some(0))
            .await
            .unwrap();
        assert_eq!(decided.revise_to, Some(0));
    }

    #[tokio::test]
    async fn test_late_decision_times_out() {
        let gate = gate(Duration::ZERO);
        let run_id = Uuid::new_v4();
        gate.request(run_id, 0, 1, "review".to_string()).await;

        assert_eq!(gate.expired(Utc::now()).await.len(), 1);

        let err = gate
            .decide(run_id, Decision::Approved, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ApprovalTimeout);
        assert_eq!(gate.get(run_id).await.unwrap().decision, Decision::Expired);
        assert!(gate.expired(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_request_survives_restart() {
        let stores = Arc::new(StoreClientFactory::fixed(Arc::new(MemoryStore::new())));
        let run_id = Uuid::new_v4();

        let gate = ApprovalGate::new(Arc::clone(&stores), Duration::from_secs(3600));
        gate.request(run_id, 0, 1, "review".to_string()).await;
        drop(gate);

        let restarted = ApprovalGate::new(stores, Duration::from_secs(3600));
        assert!(restarted.get(run_id).await.is_none());

        let loaded = restarted.load(run_id).await.unwrap();
        assert!(loaded.is_pending());
        assert_eq!(loaded.stage_index, 1);
    }
}
