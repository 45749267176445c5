//! Shared fixtures for integration tests: stub agents, a store that can be
//! switched off, and a controller wired around them.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use stagecoach::agents::{Agent, AgentError, AgentRegistry, Inputs, InvocationContext, Outputs};
use stagecoach::config::{CheckpointPolicy, Settings};
use stagecoach::core::RetryPolicy;
use stagecoach::store::{MemoryStore, SharedStore, StoreClient, StoreClientFactory, StoreError, TransportMode};
use stagecoach::{RunController, Workflow};

/// research -> strategy review -> calendar -> copy
pub const CAMPAIGN: &str = r#"
name: campaign-calendar
description: Monthly email calendar
stages:
  - name: research
    agent: researcher
    inputs: [params]
    outputs: [research_brief]
  - name: strategy_review
    approval:
      summary_from: research_brief
      revise_to: research
    outputs: [review]
  - name: calendar
    agent: planner
    inputs: [params, research_brief]
    outputs: [calendar]
  - name: copy
    agent: copywriter
    inputs: [calendar]
    outputs: [email_copy]
"#;

/// Three agent stages, no approval
pub const PIPELINE: &str = r#"
name: straight-through
stages:
  - name: research
    agent: researcher
    inputs: [params]
    outputs: [research_brief]
  - name: calendar
    agent: planner
    inputs: [research_brief]
    outputs: [calendar]
  - name: copy
    agent: copywriter
    inputs: [calendar]
    outputs: [email_copy]
"#;

pub const SETTLE: Duration = Duration::from_secs(10);

/// Produces every declared output as a string naming the agent
pub struct EchoAgent {
    name: String,
    outputs: Vec<String>,
    calls: AtomicU32,
}

impl EchoAgent {
    pub fn new(name: &str, outputs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, inputs: &Inputs, ctx: &InvocationContext) -> Result<Outputs, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.use_tool("draft")?;

        let mut outputs = Outputs::new();
        for name in &self.outputs {
            outputs.insert(
                name.clone(),
                json!({
                    "by": self.name,
                    "stage": ctx.stage_name,
                    "inputs": inputs.keys().collect::<Vec<_>>(),
                }),
            );
        }
        Ok(outputs)
    }
}

/// Fails with `error` for the first `failures` calls, then echoes
pub struct FlakyAgent {
    inner: Arc<EchoAgent>,
    failures: u32,
    error: AgentError,
    calls: AtomicU32,
}

impl FlakyAgent {
    pub fn new(name: &str, outputs: &[&str], failures: u32, error: AgentError) -> Arc<Self> {
        Arc::new(Self {
            inner: EchoAgent::new(name, outputs),
            failures,
            error,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, inputs: &Inputs, ctx: &InvocationContext) -> Result<Outputs, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(self.error.clone());
        }
        self.inner.invoke(inputs, ctx).await
    }
}

/// Signals when invoked, then never finishes on its own
pub struct StuckAgent {
    name: String,
    pub started: Notify,
    pub dropped: AtomicBool,
}

impl StuckAgent {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            started: Notify::new(),
            dropped: AtomicBool::new(false),
        })
    }
}

struct DropFlag<'a>(&'a AtomicBool);

impl Drop for DropFlag<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Agent for StuckAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _inputs: &Inputs, _ctx: &InvocationContext) -> Result<Outputs, AgentError> {
        let _flag = DropFlag(&self.dropped);
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Outputs::new())
    }
}

/// Memory store that fails every call while switched off
#[derive(Default)]
pub struct SwitchableStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl SwitchableStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreClient for SwitchableStore {
    fn transport(&self) -> TransportMode {
        TransportMode::Text
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn append(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.check()?;
        self.inner.append(key, value).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// Agents for the campaign and straight-through workflows
pub fn campaign_agents() -> AgentRegistry {
    AgentRegistry::new()
        .with(EchoAgent::new("researcher", &["research_brief"]))
        .with(EchoAgent::new("planner", &["calendar"]))
        .with(EchoAgent::new("copywriter", &["email_copy"]))
}

/// Settings with immediate retries, no background flushes and no journal
pub fn test_settings() -> Settings {
    let mut settings = Settings::with_home(std::env::temp_dir().join("stagecoach-tests"));
    settings.journal = false;
    settings.execution.retry = RetryPolicy::immediate();
    settings.checkpoint.retry = RetryPolicy::immediate();
    settings.checkpoint.retry_attempts = 0;
    settings.checkpoint.on_failure = CheckpointPolicy::Degrade;
    settings
}

pub fn controller_with(
    settings: &Settings,
    workflow: &str,
    agents: AgentRegistry,
    store: SharedStore,
) -> RunController {
    let workflow = Workflow::from_yaml(workflow).unwrap();
    RunController::new(
        settings,
        workflow,
        agents,
        Arc::new(StoreClientFactory::fixed(store)),
    )
    .unwrap()
}

pub fn campaign_controller(store: SharedStore) -> RunController {
    controller_with(&test_settings(), CAMPAIGN, campaign_agents(), store)
}

pub fn brand_params() -> Value {
    json!({"period": "2024-11"})
}
