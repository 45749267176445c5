//! Agent interface for task-executing stages.
//!
//! Agents are resolved by name from an [`AgentRegistry`] that is built
//! once at startup and never mutated afterwards. The orchestrator never
//! knows what an agent does; it hands over named inputs and expects named
//! outputs back.

pub mod command;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::AgentSpec;

pub use command::CommandAgent;

/// Named input artifacts handed to an agent
pub type Inputs = BTreeMap<String, Value>;

/// Named output artifacts returned by an agent
pub type Outputs = BTreeMap<String, Value>;

/// Failure of one agent invocation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("tool budget of {limit} calls exhausted")]
    ToolBudgetExhausted { limit: u32 },

    #[error("invocation cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

impl AgentError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::RateLimited { .. }
        )
    }

    /// Minimum wait requested by the agent before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Per-attempt context handed to an agent
#[derive(Debug)]
pub struct InvocationContext {
    pub run_id: Uuid,
    pub stage_index: usize,
    pub stage_name: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Stable across attempts of the same stage pass
    pub invocation_key: String,
    max_tool_calls: u32,
    tool_calls: AtomicU32,
    cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(
        run_id: Uuid,
        stage_index: usize,
        stage_name: impl Into<String>,
        attempt: u32,
        invocation_key: impl Into<String>,
        max_tool_calls: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            stage_index,
            stage_name: stage_name.into(),
            attempt,
            invocation_key: invocation_key.into(),
            max_tool_calls,
            tool_calls: AtomicU32::new(0),
            cancel,
        }
    }

    /// Charge one tool call against the budget.
    ///
    /// Also a cancellation safe point: fails with `Cancelled` once the run
    /// was aborted.
    pub fn use_tool(&self, tool: &str) -> Result<u32, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let used = self.tool_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if used > self.max_tool_calls {
            return Err(AgentError::ToolBudgetExhausted {
                limit: self.max_tool_calls,
            });
        }

        debug!(
            run_id = %self.run_id,
            stage_index = self.stage_index,
            tool,
            used,
            limit = self.max_tool_calls,
            "tool call"
        );
        Ok(used)
    }

    pub fn tool_calls(&self) -> u32 {
        self.tool_calls.load(Ordering::SeqCst).min(self.max_tool_calls)
    }

    pub fn max_tool_calls(&self) -> u32 {
        self.max_tool_calls
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// An external task executor
#[async_trait]
pub trait Agent: Send + Sync {
    /// Name stages refer to
    fn name(&self) -> &str;

    /// Produce outputs from inputs. May be called again with the same
    /// invocation key after a retryable failure.
    async fn invoke(&self, inputs: &Inputs, ctx: &InvocationContext) -> Result<Outputs, AgentError>;
}

/// Closed set of agents available to the workflow
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command agents declared in configuration
    pub fn from_specs(specs: &BTreeMap<String, AgentSpec>) -> Self {
        let mut registry = Self::new();
        for (name, spec) in specs {
            registry.register(Arc::new(CommandAgent::new(name.clone(), spec.clone())));
        }
        registry
    }

    /// Add an agent, replacing any previous one with the same name
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}
