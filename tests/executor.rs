//! Executor Integration Tests
//!
//! Retries, terminal failures, timeouts, tool budgets and abort.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::*;
use stagecoach::agents::{AgentError, AgentRegistry, Inputs};
use stagecoach::core::{Budget, ExecutionScope, Journal, RetryPolicy, TaskExecutor};
use stagecoach::domain::RunStatus;
use stagecoach::error::ErrorKind;
use stagecoach::store::MemoryStore;

fn executor(agents: AgentRegistry) -> TaskExecutor {
    TaskExecutor::new(Arc::new(agents), RetryPolicy::immediate(), Journal::disabled())
}

fn scope() -> ExecutionScope {
    ExecutionScope {
        run_id: Uuid::new_v4(),
        revision: 0,
        stage_index: 0,
        stage_name: "research".to_string(),
        cancel: CancellationToken::new(),
    }
}

fn budget(max_retries: u32) -> Budget {
    Budget {
        timeout: Duration::from_secs(5),
        max_retries,
        max_tool_calls: 20,
    }
}

#[tokio::test]
async fn test_flaky_agent_succeeds_on_third_attempt() {
    let agent = FlakyAgent::new(
        "researcher",
        &["research_brief"],
        2,
        AgentError::Network("connection reset".into()),
    );
    let executor = executor(AgentRegistry::new().with(agent.clone()));

    let report = executor
        .execute("researcher", Inputs::new(), budget(3), &scope())
        .await
        .unwrap();

    assert_eq!(agent.calls(), 3);
    assert_eq!(report.attempts.len(), 3);
    assert!(!report.attempts[0].succeeded());
    assert!(report.attempts[0].retryable);
    assert!(!report.attempts[1].succeeded());
    assert!(report.attempts[2].succeeded());
    assert_eq!(
        report.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(report.outputs.contains_key("research_brief"));
}

#[tokio::test]
async fn test_retries_exhausted_is_transient() {
    let agent = FlakyAgent::new(
        "researcher",
        &["research_brief"],
        u32::MAX,
        AgentError::Timeout("upstream slow".into()),
    );
    let executor = executor(AgentRegistry::new().with(agent.clone()));

    let err = executor
        .execute("researcher", Inputs::new(), budget(2), &scope())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Transient);
    assert_eq!(err.attempts.len(), 3);
    assert_eq!(agent.calls(), 3);
}

#[tokio::test]
async fn test_terminal_error_is_not_retried() {
    let agent = FlakyAgent::new(
        "researcher",
        &["research_brief"],
        u32::MAX,
        AgentError::PolicyViolation("disallowed claim".into()),
    );
    let executor = executor(AgentRegistry::new().with(agent.clone()));

    let err = executor
        .execute("researcher", Inputs::new(), budget(3), &scope())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::TerminalTask);
    assert_eq!(err.attempts.len(), 1);
    assert_eq!(agent.calls(), 1);
    assert_eq!(
        err.last_error,
        Some(AgentError::PolicyViolation("disallowed claim".into()))
    );
}

#[tokio::test]
async fn test_attempt_timeout_is_retryable() {
    let agent = StuckAgent::new("researcher");
    let executor = executor(AgentRegistry::new().with(agent.clone()));

    let started = Instant::now();
    let err = executor
        .execute(
            "researcher",
            Inputs::new(),
            Budget {
                timeout: Duration::from_millis(50),
                max_retries: 1,
                max_tool_calls: 20,
            },
            &scope(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Transient);
    assert_eq!(err.attempts.len(), 2);
    assert!(err.attempts.iter().all(|a| a.retryable));
    assert!(started.elapsed() < Duration::from_secs(5));
    // Timed-out invocation was dropped
    assert!(agent.dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_tool_budget_exhaustion_is_terminal() {
    let agent = EchoAgent::new("researcher", &["research_brief"]);
    let executor = executor(AgentRegistry::new().with(agent.clone()));

    let err = executor
        .execute(
            "researcher",
            Inputs::new(),
            Budget {
                timeout: Duration::from_secs(5),
                max_retries: 3,
                max_tool_calls: 0,
            },
            &scope(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::TerminalTask);
    assert_eq!(err.last_error, Some(AgentError::ToolBudgetExhausted { limit: 0 }));
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_rate_limit_delay_is_honored() {
    let agent = FlakyAgent::new(
        "researcher",
        &["research_brief"],
        1,
        AgentError::RateLimited {
            retry_after: Some(Duration::from_millis(100)),
        },
    );
    let executor = executor(AgentRegistry::new().with(agent));

    let started = Instant::now();
    let report = executor
        .execute("researcher", Inputs::new(), budget(1), &scope())
        .await
        .unwrap();

    assert_eq!(report.attempts.len(), 2);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_cancel_interrupts_attempt() {
    let agent = StuckAgent::new("researcher");
    let executor = executor(AgentRegistry::new().with(agent.clone()));
    let scope = scope();
    let cancel = scope.cancel.clone();

    let started = agent.clone();
    tokio::spawn(async move {
        started.started.notified().await;
        cancel.cancel();
    });

    let err = executor
        .execute("researcher", Inputs::new(), budget(3), &scope)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Aborted);
    assert_eq!(err.attempts.len(), 1);
    assert!(agent.dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_flaky_stage_attempts_recorded_on_run() {
    let planner = FlakyAgent::new("planner", &["calendar"], 2, AgentError::Network("reset".into()));
    let agents = campaign_agents().with(planner);
    let controller = controller_with(&test_settings(), PIPELINE, agents, Arc::new(MemoryStore::new()));

    let run_id = controller.start_run("brandX", brand_params()).await.unwrap();
    controller.wait_settled(&run_id.to_string(), SETTLE).await.unwrap();

    let run = controller.orchestrator().get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.stage_attempts.get(&0), Some(&1));
    assert_eq!(run.stage_attempts.get(&1), Some(&3));
}

#[tokio::test]
async fn test_abort_stops_running_stage() {
    let stuck = StuckAgent::new("planner");
    let agents = campaign_agents().with(stuck.clone());
    let controller = controller_with(&test_settings(), PIPELINE, agents, Arc::new(MemoryStore::new()));

    let run_id = controller.start_run("brandX", brand_params()).await.unwrap().to_string();
    stuck.started.notified().await;

    let view = controller.abort_run(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Aborted);
    assert_eq!(view.error.as_ref().map(|e| e.kind), Some(ErrorKind::Aborted));
    assert_eq!(view.current_stage_index, 1);
    assert!(view.artifacts.contains_key("research_brief"));

    // The in-flight invocation is dropped
    let settled = controller.wait_settled(&run_id, SETTLE).await.unwrap();
    assert_eq!(settled.status, RunStatus::Aborted);
    for _ in 0..50 {
        if stuck.dropped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(stuck.dropped.load(Ordering::SeqCst));

    // Terminal runs stay terminal
    let err = controller.abort_run(&run_id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    let err = controller
        .submit_approval(&run_id, "approve", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}
