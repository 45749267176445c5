//! Approval Integration Tests
//!
//! Concurrent decisions, expiry and decisions on runs in the wrong state.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use stagecoach::domain::{Decision, RunStatus};
use stagecoach::error::ErrorKind;
use stagecoach::store::MemoryStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_decisions_one_wins() {
    let controller = campaign_controller(Arc::new(MemoryStore::new()));
    let run_id = controller.start_run("brandX", brand_params()).await.unwrap().to_string();
    controller.wait_settled(&run_id, SETTLE).await.unwrap();

    let (a, b) = (controller.clone(), controller.clone());
    let (id_a, id_b) = (run_id.clone(), run_id.clone());
    let first = tokio::spawn(async move {
        a.submit_approval(&id_a, "approve", None, Some("ana".into()), None).await
    });
    let second = tokio::spawn(async move {
        b.submit_approval(&id_b, "reject", None, Some("bo".into()), None).await
    });

    let results = vec![first.await.unwrap(), second.await.unwrap()];
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let losers: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 1);
    assert_eq!(losers[0].kind, ErrorKind::AlreadyDecided);

    // The run follows the winning decision
    let view = controller.wait_settled(&run_id, SETTLE).await.unwrap();
    match winners[0].decision {
        Decision::Approved => assert_eq!(view.status, RunStatus::Completed),
        Decision::Rejected => assert_eq!(view.status, RunStatus::Failed),
        other => panic!("unexpected decision {}", other),
    }
}

#[tokio::test]
async fn test_second_decision_after_completion() {
    let controller = campaign_controller(Arc::new(MemoryStore::new()));
    let run_id = controller.start_run("brandX", brand_params()).await.unwrap().to_string();
    controller.wait_settled(&run_id, SETTLE).await.unwrap();

    controller
        .submit_approval(&run_id, "approve", None, None, None)
        .await
        .unwrap();
    controller.wait_settled(&run_id, SETTLE).await.unwrap();

    let err = controller
        .submit_approval(&run_id, "approve", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyDecided);
}

#[tokio::test]
async fn test_expired_approval_fails_run() {
    let mut settings = test_settings();
    settings.approval.max_wait_seconds = 0;
    let controller = controller_with(&settings, CAMPAIGN, campaign_agents(), Arc::new(MemoryStore::new()));

    let run_id = controller.start_run("brandX", brand_params()).await.unwrap();
    controller.wait_settled(&run_id.to_string(), SETTLE).await.unwrap();

    let expired = controller.sweep_expired_approvals().await;
    assert_eq!(expired, vec![run_id]);

    let view = controller.get_run(&run_id.to_string()).await.unwrap();
    assert_eq!(view.status, RunStatus::Failed);
    assert_eq!(view.error.unwrap().kind, ErrorKind::ApprovalTimeout);

    let err = controller
        .submit_approval(&run_id.to_string(), "approve", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ApprovalTimeout);

    // Nothing left to sweep
    assert!(controller.sweep_expired_approvals().await.is_empty());
}

#[tokio::test]
async fn test_late_decision_times_out() {
    let mut settings = test_settings();
    settings.approval.max_wait_seconds = 0;
    let controller = controller_with(&settings, CAMPAIGN, campaign_agents(), Arc::new(MemoryStore::new()));

    let run_id = controller.start_run("brandX", brand_params()).await.unwrap().to_string();
    controller.wait_settled(&run_id, SETTLE).await.unwrap();

    let err = controller
        .submit_approval(&run_id, "approve", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ApprovalTimeout);

    let view = controller.get_run(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Failed);
    assert_eq!(view.error.unwrap().kind, ErrorKind::ApprovalTimeout);
}

#[tokio::test]
async fn test_expiry_reaper_runs_in_background() {
    let mut settings = test_settings();
    settings.approval.max_wait_seconds = 0;
    let controller = controller_with(&settings, CAMPAIGN, campaign_agents(), Arc::new(MemoryStore::new()));
    let reaper = controller.spawn_expiry_reaper(Duration::from_millis(20));

    let run_id = controller.start_run("brandX", brand_params()).await.unwrap().to_string();
    controller.wait_settled(&run_id, SETTLE).await.unwrap();

    let mut status = RunStatus::AwaitingApproval;
    for _ in 0..100 {
        status = controller.get_run(&run_id).await.unwrap().status;
        if status == RunStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, RunStatus::Failed);

    controller.shutdown();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_decision_on_aborted_run() {
    let controller = campaign_controller(Arc::new(MemoryStore::new()));
    let run_id = controller.start_run("brandX", brand_params()).await.unwrap().to_string();
    controller.wait_settled(&run_id, SETTLE).await.unwrap();

    controller.abort_run(&run_id).await.unwrap();

    let err = controller
        .submit_approval(&run_id, "approve", None, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Aborted);
}

#[tokio::test]
async fn test_revise_target_must_precede_gate() {
    let controller = campaign_controller(Arc::new(MemoryStore::new()));
    let run_id = controller.start_run("brandX", brand_params()).await.unwrap().to_string();
    controller.wait_settled(&run_id, SETTLE).await.unwrap();

    let err = controller
        .submit_approval(&run_id, "revise", None, None, Some(3))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInput);

    let err = controller
        .submit_approval(&run_id, "approve", None, None, Some(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInput);

    // Request is still open
    let view = controller.get_run(&run_id).await.unwrap();
    assert!(view.approval.unwrap().is_pending());
}
