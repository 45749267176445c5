//! Task executor: runs one agent stage under a budget.
//!
//! Each attempt is bounded by the budget's timeout and races the run's
//! cancellation token. Retryable failures back off with jitter; terminal
//! failures return immediately. Every attempt is recorded in the report
//! and the run journal before `execute` returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::agents::{AgentError, AgentRegistry, Inputs, InvocationContext, Outputs};
use crate::config::ExecutionSettings;
use crate::domain::{Event, EventType};
use crate::error::ErrorKind;

use super::journal::Journal;
use super::retry::RetryPolicy;

/// Limits for one stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Wall-clock limit per attempt
    pub timeout: Duration,
    /// Attempts after the first
    pub max_retries: u32,
    /// Tool calls per attempt
    pub max_tool_calls: u32,
}

impl Budget {
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_seconds),
            max_retries: settings.max_retries,
            max_tool_calls: settings.max_tool_calls,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Which run and stage an execution belongs to
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub run_id: Uuid,
    pub revision: u32,
    pub stage_index: usize,
    pub stage_name: String,
    pub cancel: CancellationToken,
}

/// Audit record of one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// None on success
    pub error: Option<String>,
    pub retryable: bool,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Successful execution
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outputs: Outputs,
    pub attempts: Vec<AttemptRecord>,
    pub invocation_key: String,
}

/// Failed execution: terminal error, exhausted retries or cancellation
#[derive(Debug, Clone, Error)]
#[error("{message} ({} attempt(s))", attempts.len())]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub last_error: Option<AgentError>,
    pub attempts: Vec<AttemptRecord>,
}

impl ExecutionError {
    fn new(kind: ErrorKind, message: impl Into<String>, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            kind,
            message: message.into(),
            last_error: None,
            attempts,
        }
    }
}

/// Stable key identifying one stage pass, handed to agents for idempotency
pub fn invocation_key(run_id: Uuid, revision: u32, stage_index: usize, inputs: &Inputs) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(revision.to_be_bytes());
    hasher.update((stage_index as u64).to_be_bytes());
    // BTreeMap keeps serialization order stable
    hasher.update(serde_json::to_vec(inputs).unwrap_or_default());
    let digest = hasher.finalize();
    hex::encode(&digest[..8]) // First 16 hex chars (8 bytes)
}

pub struct TaskExecutor {
    agents: Arc<AgentRegistry>,
    retry: RetryPolicy,
    journal: Journal,
}

impl TaskExecutor {
    pub fn new(agents: Arc<AgentRegistry>, retry: RetryPolicy, journal: Journal) -> Self {
        Self {
            agents,
            retry,
            journal,
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Invoke `agent_name` with retries until success, a terminal error,
    /// exhausted retries or cancellation.
    #[instrument(
        skip(self, inputs, budget, scope),
        fields(run_id = %scope.run_id, stage = %scope.stage_name)
    )]
    pub async fn execute(
        &self,
        agent_name: &str,
        inputs: Inputs,
        budget: Budget,
        scope: &ExecutionScope,
    ) -> Result<ExecutionReport, ExecutionError> {
        let agent = self.agents.get(agent_name).ok_or_else(|| {
            ExecutionError::new(
                ErrorKind::TerminalTask,
                format!("unknown agent '{}'", agent_name),
                Vec::new(),
            )
        })?;

        let key = invocation_key(scope.run_id, scope.revision, scope.stage_index, &inputs);
        let max_attempts = budget.max_attempts();
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for attempt in 1..=max_attempts {
            if scope.cancel.is_cancelled() {
                return Err(Self::aborted(scope, attempts));
            }

            let ctx = InvocationContext::new(
                scope.run_id,
                scope.stage_index,
                scope.stage_name.clone(),
                attempt,
                key.clone(),
                budget.max_tool_calls,
                scope.cancel.clone(),
            );

            let started_at = Utc::now();
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => Err(AgentError::Cancelled),
                outcome = timeout(budget.timeout, agent.invoke(&inputs, &ctx)) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout(format!(
                        "no result within {}ms",
                        budget.timeout.as_millis()
                    ))),
                },
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            let record = AttemptRecord {
                attempt,
                started_at,
                duration_ms,
                error: result.as_ref().err().map(ToString::to_string),
                retryable: result.as_ref().err().map_or(false, AgentError::is_retryable),
            };
            self.record_attempt(scope, &key, &record).await;
            attempts.push(record);

            match result {
                Ok(outputs) => {
                    info!(agent = agent_name, attempt, duration_ms, "stage executed");
                    return Ok(ExecutionReport {
                        outputs,
                        attempts,
                        invocation_key: key,
                    });
                }
                Err(AgentError::Cancelled) => {
                    return Err(Self::aborted(scope, attempts));
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let mut delay = self.retry.jittered_delay(attempt);
                    if let Some(floor) = e.retry_after() {
                        delay = delay.max(floor);
                    }

                    warn!(
                        agent = agent_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = scope.cancel.cancelled() => {
                            return Err(Self::aborted(scope, attempts));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    let (kind, message) = if e.is_retryable() {
                        (
                            ErrorKind::Transient,
                            format!("agent '{}' still failing after retries: {}", agent_name, e),
                        )
                    } else {
                        (
                            ErrorKind::TerminalTask,
                            format!("agent '{}' failed: {}", agent_name, e),
                        )
                    };
                    error!(agent = agent_name, attempt, error = %e, "stage failed permanently");

                    return Err(ExecutionError {
                        kind,
                        message,
                        last_error: Some(e),
                        attempts,
                    });
                }
            }
        }

        // max_attempts >= 1, so the loop always returns
        Err(ExecutionError::new(
            ErrorKind::Internal,
            "no attempt was made",
            attempts,
        ))
    }

    fn aborted(scope: &ExecutionScope, attempts: Vec<AttemptRecord>) -> ExecutionError {
        ExecutionError {
            kind: ErrorKind::Aborted,
            message: format!("run {} was aborted", scope.run_id),
            last_error: Some(AgentError::Cancelled),
            attempts,
        }
    }

    async fn record_attempt(&self, scope: &ExecutionScope, key: &str, record: &AttemptRecord) {
        let event = match &record.error {
            None => Event::new(
                scope.run_id,
                Some(scope.stage_index),
                EventType::AttemptSucceeded,
                format!("Stage '{}' attempt {} succeeded", scope.stage_name, record.attempt),
            ),
            Some(error) => Event::new(
                scope.run_id,
                Some(scope.stage_index),
                EventType::AttemptFailed,
                format!("Stage '{}' attempt {} failed", scope.stage_name, record.attempt),
            )
            .with_error(error.clone()),
        }
        .with_idempotency_key(key)
        .with_attempt(record.attempt)
        .with_duration(record.duration_ms);

        self.journal.record(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_key_is_stable() {
        let run_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let mut inputs = Inputs::new();
        inputs.insert("params".to_string(), json!({"period": "2024-11"}));

        let a = invocation_key(run_id, 0, 1, &inputs);
        let b = invocation_key(run_id, 0, 1, &inputs);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // Revision and stage both change the key
        assert_ne!(a, invocation_key(run_id, 1, 1, &inputs));
        assert_ne!(a, invocation_key(run_id, 0, 2, &inputs));
    }

    #[test]
    fn test_budget_from_settings() {
        let budget = Budget::from_settings(&ExecutionSettings::default());
        assert_eq!(budget.timeout, Duration::from_secs(300));
        assert_eq!(budget.max_attempts(), 4);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_terminal() {
        let executor = TaskExecutor::new(
            Arc::new(AgentRegistry::new()),
            RetryPolicy::immediate(),
            Journal::disabled(),
        );
        let scope = ExecutionScope {
            run_id: Uuid::new_v4(),
            revision: 0,
            stage_index: 0,
            stage_name: "research".to_string(),
            cancel: CancellationToken::new(),
        };

        let err = executor
            .execute(
                "ghost",
                Inputs::new(),
                Budget::from_settings(&ExecutionSettings::default()),
                &scope,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::TerminalTask);
        assert!(err.attempts.is_empty());
    }
}
