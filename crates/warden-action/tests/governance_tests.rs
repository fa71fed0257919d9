//! End-to-end tests for the governance pipeline.
//!
//! Every scenario runs against both store implementations: the in-process
//! `MemoryProposalStore` and `SqliteProposalStore` on an in-memory database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use warden_action::{
    handler_fn, ActionError, ActionHandler, GovernanceError, GovernancePipeline, HandlerOutput,
    ProposeRequest,
};
use warden_core::config::WardenConfig;
use warden_core::types::{ActionResult, ActionSource, ApprovalRule, ProposalStatus, RiskLevel};
use warden_storage::{Database, MemoryProposalStore, ProposalStore, SqliteProposalStore};

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One fresh store of each kind.
fn stores() -> Vec<(&'static str, Arc<dyn ProposalStore>)> {
    let db = Arc::new(Database::in_memory().unwrap());
    vec![
        ("memory", Arc::new(MemoryProposalStore::new())),
        ("sqlite", Arc::new(SqliteProposalStore::new(db))),
    ]
}

fn pipelines(config: &WardenConfig) -> Vec<(&'static str, GovernancePipeline)> {
    init_tracing();
    stores()
        .into_iter()
        .map(|(name, store)| (name, GovernancePipeline::new(store, config).unwrap()))
        .collect()
}

/// Handler that counts invocations and echoes the payload title.
fn counting_handler(calls: Arc<AtomicUsize>) -> Arc<dyn ActionHandler> {
    Arc::new(handler_fn(move |payload: Value| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ActionError>(HandlerOutput::Map(json!({
                "success": true,
                "title": payload["title"],
            })))
        }
    }))
}

/// The persisted result matches what `execute` returned. SQLite keeps
/// millisecond timestamps, so `executed_at` is compared at that precision.
fn assert_stored(pipeline: &GovernancePipeline, result: &ActionResult, name: &str) {
    let stored = pipeline.get_result(result.action_id).unwrap().unwrap();
    assert_eq!(stored.success, result.success, "{name}");
    assert_eq!(stored.result_data, result.result_data, "{name}");
    assert_eq!(stored.error, result.error, "{name}");
    assert_eq!(stored.side_effects, result.side_effects, "{name}");
    assert_eq!(stored.execution_time_ms, result.execution_time_ms, "{name}");
    assert_eq!(
        stored.executed_at.timestamp_millis(),
        result.executed_at.timestamp_millis(),
        "{name}"
    );
}

fn low_risk_task(target_id: &str) -> ProposeRequest {
    ProposeRequest::new("task_create", "task", target_id)
        .with_payload(json!({"title": "Draft Q3 plan"}))
        .with_risk_level(RiskLevel::Low)
        .with_confidence(0.9)
}

// =============================================================================
// Idempotency
// =============================================================================

#[test]
fn test_concurrent_propose_same_key_creates_one_proposal() {
    for (name, pipeline) in pipelines(&WardenConfig::default()) {
        let ids: Vec<Uuid> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let pipeline = &pipeline;
                    s.spawn(move || {
                        pipeline
                            .propose(
                                ProposeRequest::new("email_send", "email", "msg-1")
                                    .with_idempotency_key("sync-2024-05-01"),
                            )
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let distinct: HashSet<Uuid> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 1, "{name}: callers saw different ids");
        assert_eq!(
            pipeline.list_pending(None, None, 100).unwrap().len(),
            1,
            "{name}: more than one proposal stored"
        );
    }
}

#[test]
fn test_distinct_keys_create_distinct_proposals() {
    for (name, pipeline) in pipelines(&WardenConfig::default()) {
        let a = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m").with_idempotency_key("a"))
            .unwrap();
        let b = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m").with_idempotency_key("b"))
            .unwrap();
        let c = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m"))
            .unwrap();
        assert_ne!(a, b, "{name}");
        assert_ne!(b, c, "{name}");
        assert_eq!(pipeline.list_pending(None, None, 100).unwrap().len(), 3, "{name}");
    }
}

// =============================================================================
// Policy
// =============================================================================

#[test]
fn test_policy_ordinality_through_propose() {
    let mut config = WardenConfig::default();
    config.policy.rules = vec![ApprovalRule::new("email_send", RiskLevel::Medium, true)];

    for (name, pipeline) in pipelines(&config) {
        let expected = [
            (RiskLevel::Low, ProposalStatus::Approved),
            (RiskLevel::Medium, ProposalStatus::Approved),
            (RiskLevel::High, ProposalStatus::Proposed),
            (RiskLevel::Critical, ProposalStatus::Proposed),
        ];
        for (risk, status) in expected {
            let id = pipeline
                .propose(ProposeRequest::new("email_send", "email", "m").with_risk_level(risk))
                .unwrap();
            let p = pipeline.get_proposal(id).unwrap().unwrap();
            assert_eq!(p.status, status, "{name}: risk {risk}");
        }
    }
}

#[test]
fn test_confidence_override() {
    for (name, pipeline) in pipelines(&WardenConfig::default()) {
        let id = pipeline.propose(low_risk_task("t-1").with_confidence(0.3)).unwrap();
        let p = pipeline.get_proposal(id).unwrap().unwrap();
        assert!(p.requires_approval, "{name}");
        assert_eq!(p.status, ProposalStatus::Proposed, "{name}");
        assert!(p.approved_by.is_none(), "{name}");
    }
}

#[test]
fn test_front_end_json_validation() {
    for (name, pipeline) in pipelines(&WardenConfig::default()) {
        let err = ProposeRequest::from_json(json!({
            "action_type": "task_create",
            "target_entity": "task",
            "target_id": "t-1",
            "risk_level": "severe",
            "source": "manual",
            "confidence_score": 0.9
        }))
        .unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(_)), "{name}");
        assert!(pipeline.list_pending(None, None, 10).unwrap().is_empty(), "{name}");

        let request = ProposeRequest::from_json(json!({
            "action_type": "task_create",
            "target_entity": "task",
            "target_id": "t-1",
            "payload": {"title": "From JSON"},
            "risk_level": "low",
            "source": "scheduled",
            "confidence_score": 0.9
        }))
        .unwrap();
        let id = pipeline.propose(request).unwrap();
        let p = pipeline.get_proposal(id).unwrap().unwrap();
        assert_eq!(p.source, ActionSource::Scheduled, "{name}");
        assert_eq!(p.payload["title"], "From JSON", "{name}");
    }
}

// =============================================================================
// State machine
// =============================================================================

#[test]
fn test_approve_and_reject_race_has_one_winner() {
    for (name, pipeline) in pipelines(&WardenConfig::default()) {
        for round in 0..10 {
            let id = pipeline
                .propose(ProposeRequest::new("email_send", "email", format!("m-{round}")))
                .unwrap();

            let (approved, rejected) = std::thread::scope(|s| {
                let pipeline = &pipeline;
                let a = s.spawn(move || pipeline.approve(id, "alice", None).unwrap());
                let r = s.spawn(move || pipeline.reject(id, "bob", "not needed").unwrap());
                (a.join().unwrap(), r.join().unwrap())
            });

            assert!(approved ^ rejected, "{name}: both or neither won");
            let p = pipeline.get_proposal(id).unwrap().unwrap();
            if approved {
                assert_eq!(p.status, ProposalStatus::Approved, "{name}");
                assert!(p.rejected_by.is_none(), "{name}");
            } else {
                assert_eq!(p.status, ProposalStatus::Rejected, "{name}");
                assert!(p.approved_by.is_none(), "{name}");
            }
        }
    }
}

#[tokio::test]
async fn test_illegal_transitions_are_reported() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        pipeline.register("email_send", counting_handler(Arc::new(AtomicUsize::new(0))), None);

        let id = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m"))
            .unwrap();

        // proposed -> executing
        let err = pipeline.execute(id, false).await.unwrap_err();
        assert!(
            matches!(
                err,
                GovernanceError::InvalidTransition(ProposalStatus::Proposed, ProposalStatus::Executing)
            ),
            "{name}: {err:?}"
        );

        assert!(pipeline.reject(id, "alice", "spam").unwrap(), "{name}");
        // rejected -> approved
        assert!(!pipeline.approve(id, "bob", None).unwrap(), "{name}");
        // rejected -> executing
        let err = pipeline.execute(id, false).await.unwrap_err();
        assert!(
            matches!(err, GovernanceError::InvalidTransition(ProposalStatus::Rejected, _)),
            "{name}: {err:?}"
        );
        assert_eq!(
            pipeline.get_proposal(id).unwrap().unwrap().status,
            ProposalStatus::Rejected,
            "{name}"
        );
    }
}

// =============================================================================
// Two approvals
// =============================================================================

#[tokio::test]
async fn test_critical_delete_needs_two_distinct_approvers() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register("task_delete", counting_handler(calls.clone()), None);

        let id = pipeline
            .propose(
                ProposeRequest::new("task_delete", "task", "t-7")
                    .with_risk_level(RiskLevel::Critical)
                    .with_confidence(0.95),
            )
            .unwrap();
        let p = pipeline.get_proposal(id).unwrap().unwrap();
        assert!(p.requires_approval && p.requires_two_approvals, "{name}");

        assert!(pipeline.approve(id, "alice", None).unwrap(), "{name}");
        assert!(!pipeline.approve(id, "alice", None).unwrap(), "{name}");
        let err = pipeline.execute(id, false).await.unwrap_err();
        assert!(matches!(err, GovernanceError::InvalidTransition(..)), "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{name}");

        assert!(pipeline.approve(id, "bob", None).unwrap(), "{name}");
        let result = pipeline.execute(id, false).await.unwrap();
        assert!(result.success, "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
    }
}

#[test]
fn test_concurrent_approvers_keep_both_contexts() {
    for (name, pipeline) in pipelines(&WardenConfig::default()) {
        for round in 0..10 {
            let id = pipeline
                .propose(
                    ProposeRequest::new("task_delete", "task", format!("t-{round}"))
                        .with_payload(json!({"reason": "duplicate"}))
                        .with_risk_level(RiskLevel::Critical),
                )
                .unwrap();

            std::thread::scope(|s| {
                let pipeline = &pipeline;
                s.spawn(move || {
                    assert!(pipeline
                        .approve(id, "alice", Some(json!({"alice": "checked backups"})))
                        .unwrap());
                });
                s.spawn(move || {
                    assert!(pipeline
                        .approve(id, "bob", Some(json!({"bob": "owner agreed"})))
                        .unwrap());
                });
            });

            let p = pipeline.get_proposal(id).unwrap().unwrap();
            assert_eq!(p.status, ProposalStatus::Approved, "{name}");
            assert_eq!(p.payload["reason"], "duplicate", "{name}");
            assert_eq!(
                p.payload["approval_context"],
                json!({"alice": "checked backups", "bob": "owner agreed"}),
                "{name}: a vote's context was lost"
            );
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

#[tokio::test]
async fn test_dry_run_scenario() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register("task_create", counting_handler(calls.clone()), None);

        let id = pipeline
            .propose(low_risk_task("t-1").with_source(ActionSource::Manual))
            .unwrap();
        let p = pipeline.get_proposal(id).unwrap().unwrap();
        assert_eq!(p.status, ProposalStatus::Approved, "{name}");
        assert_eq!(p.approved_by.as_deref(), Some("system_policy"), "{name}");

        let result = pipeline.execute(id, true).await.unwrap();
        assert!(result.success, "{name}");
        assert_eq!(
            result.result_data,
            json!({"dry_run": true, "payload": {"title": "Draft Q3 plan"}}),
            "{name}"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{name}");
        assert_stored(&pipeline, &result, name);
    }
}

#[tokio::test]
async fn test_rate_limit_three_then_denied_then_reset() {
    let mut config = WardenConfig::default();
    config.governance.rate_limit_window_secs = 1;

    for (name, mut pipeline) in pipelines(&config) {
        pipeline.register("task_create", counting_handler(Arc::new(AtomicUsize::new(0))), Some(3));

        let ids: Vec<Uuid> = (0..4)
            .map(|i| pipeline.propose(low_risk_task(&format!("t-{i}"))).unwrap())
            .collect();

        for id in &ids[..3] {
            assert!(pipeline.execute(*id, false).await.unwrap().success, "{name}");
        }
        let err = pipeline.execute(ids[3], false).await.unwrap_err();
        assert!(matches!(err, GovernanceError::RateLimited { max_per_minute: 3, .. }), "{name}");
        assert_eq!(
            pipeline.get_proposal(ids[3]).unwrap().unwrap().status,
            ProposalStatus::Approved,
            "{name}"
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(pipeline.execute(ids[3], false).await.unwrap().success, "{name}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_execute_runs_handler_once() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register("task_create", counting_handler(calls.clone()), None);
        let id = pipeline.propose(low_risk_task("t-1")).unwrap();

        let pipeline = Arc::new(pipeline);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move { pipeline.execute(id, false).await })
            })
            .collect();

        let mut successes = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(result) => {
                    assert!(result.success, "{name}");
                    successes += 1;
                }
                Err(e) => assert!(
                    matches!(e, GovernanceError::InvalidTransition(..)),
                    "{name}: {e:?}"
                ),
            }
        }
        assert_eq!(successes, 1, "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
        assert!(pipeline.get_result(id).unwrap().is_some(), "{name}");
    }
}

#[tokio::test]
async fn test_timeout_leaves_failed_not_executing() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        pipeline.register(
            "task_create",
            Arc::new(handler_fn(|_payload: Value| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ActionError>(HandlerOutput::Map(json!({"success": true})))
            })),
            None,
        );
        let id = pipeline.propose(low_risk_task("t-1")).unwrap();

        let result = pipeline
            .execute_with_timeout(id, false, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!result.success, "{name}");
        assert!(result.error.as_deref().unwrap().contains("timed out"), "{name}");
        assert_eq!(
            pipeline.get_proposal(id).unwrap().unwrap().status,
            ProposalStatus::Failed,
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_handler_error_message_preserved() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        pipeline.register(
            "email_send",
            Arc::new(handler_fn(|_payload: Value| async {
                Err::<HandlerOutput, _>(ActionError::HandlerFailed(
                    "550 5.1.1 recipient rejected".to_string(),
                ))
            })),
            None,
        );
        let id = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m-1"))
            .unwrap();
        assert!(pipeline.approve(id, "alice", None).unwrap());

        let result = pipeline.execute(id, false).await.unwrap();
        assert!(!result.success, "{name}");
        assert_eq!(result.error.as_deref(), Some("550 5.1.1 recipient rejected"), "{name}");
        assert_stored(&pipeline, &result, name);
    }
}

// =============================================================================
// Hooks
// =============================================================================

#[tokio::test]
async fn test_hook_order_and_visibility() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        let events = Arc::new(Mutex::new(Vec::new()));
        pipeline.register("task_create", counting_handler(Arc::new(AtomicUsize::new(0))), None);
        {
            let events = Arc::clone(&events);
            pipeline.register_before(move |p| {
                events.lock().unwrap().push(format!("before:{}", p.status));
                Ok(())
            });
        }
        {
            let events = Arc::clone(&events);
            pipeline.register_on_error(move |_, _| {
                events.lock().unwrap().push("on_error".to_string());
                Ok(())
            });
        }
        {
            let events = Arc::clone(&events);
            pipeline.register_after(move |p, result| {
                events
                    .lock()
                    .unwrap()
                    .push(format!("after:{}:{}", p.status, result.success));
                Err("audit sink unavailable".to_string())
            });
        }

        let id = pipeline.propose(low_risk_task("t-1")).unwrap();
        let result = pipeline.execute(id, false).await.unwrap();
        assert!(result.success, "{name}");
        assert_eq!(
            *events.lock().unwrap(),
            vec!["before:approved".to_string(), "after:success:true".to_string()],
            "{name}"
        );
        assert_eq!(
            pipeline.get_proposal(id).unwrap().unwrap().status,
            ProposalStatus::Success,
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_before_hook_failure_allows_retry() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        let calls = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        pipeline.register("task_create", counting_handler(calls.clone()), None);
        {
            let open = Arc::clone(&open);
            pipeline.register_before(move |_| {
                if open.load(Ordering::SeqCst) == 0 {
                    Err("maintenance window".to_string())
                } else {
                    Ok(())
                }
            });
        }

        let id = pipeline.propose(low_risk_task("t-1")).unwrap();
        let err = pipeline.execute(id, false).await.unwrap_err();
        assert!(matches!(err, GovernanceError::HookFailed(_)), "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "{name}");
        assert!(pipeline.get_result(id).unwrap().is_none(), "{name}");

        open.store(1, Ordering::SeqCst);
        assert!(pipeline.execute(id, false).await.unwrap().success, "{name}");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{name}");
    }
}

// =============================================================================
// Query surface
// =============================================================================

#[tokio::test]
async fn test_pending_queue_and_history() {
    for (name, mut pipeline) in pipelines(&WardenConfig::default()) {
        pipeline.register("email_send", counting_handler(Arc::new(AtomicUsize::new(0))), None);

        let first = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m-1"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m-2"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = pipeline
            .propose(ProposeRequest::new("calendar_create", "event", "m-1"))
            .unwrap();

        let pending: Vec<Uuid> = pipeline
            .list_pending(None, None, 10)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(pending, vec![first, second, third], "{name}");

        let emails = pipeline.list_pending(None, Some("email_send"), 10).unwrap();
        assert_eq!(emails.len(), 2, "{name}");

        assert!(pipeline.approve(first, "alice", None).unwrap());
        pipeline.execute(first, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pipeline.reject(third, "alice", "duplicate").unwrap());

        let history: Vec<Uuid> = pipeline
            .list_history(None, None, 10)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(history, vec![third, first], "{name}");

        let for_m1 = pipeline.list_history(Some("m-1"), Some("email_send"), 10).unwrap();
        assert_eq!(for_m1.len(), 1, "{name}");
        assert_eq!(for_m1[0].status, ProposalStatus::Success, "{name}");

        let pending = pipeline.list_pending(None, None, 10).unwrap();
        assert_eq!(pending.len(), 1, "{name}");
        assert_eq!(pending[0].id, second, "{name}");
    }
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn test_sqlite_state_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = WardenConfig::default();
    config.general.data_dir = dir.path().to_string_lossy().into_owned();

    let (pending_id, done_id) = {
        let mut pipeline = GovernancePipeline::open(&config).unwrap();
        pipeline.register("task_create", counting_handler(Arc::new(AtomicUsize::new(0))), None);
        let pending_id = pipeline
            .propose(ProposeRequest::new("email_send", "email", "m-1").with_idempotency_key("k-1"))
            .unwrap();
        let done_id = pipeline.propose(low_risk_task("t-1")).unwrap();
        pipeline.execute(done_id, false).await.unwrap();
        (pending_id, done_id)
    };

    let pipeline = GovernancePipeline::open(&config).unwrap();
    let again = pipeline
        .propose(ProposeRequest::new("email_send", "email", "m-1").with_idempotency_key("k-1"))
        .unwrap();
    assert_eq!(again, pending_id);
    assert_eq!(pipeline.list_pending(None, None, 10).unwrap().len(), 1);

    let result = pipeline.get_result(done_id).unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.result_data["title"], "Draft Q3 plan");
}
