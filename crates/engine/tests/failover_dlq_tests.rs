//! Failover replanning and DLQ recovery scenarios

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use synapse_engine::{
    DlqCancelRequest, DlqQuery, DlqResumeRequest, EventType, ExecutionStatus, ToolRegistry,
    TraceContext,
};

async fn collect_events(
    harness: &Harness,
    rx: &mut tokio::sync::broadcast::Receiver<synapse_engine::SagaEvent>,
) -> Vec<synapse_engine::SagaEvent> {
    harness.runtime.drainer.drain_once().await.unwrap();
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Rewrite the stored execution record so it looks like a stalled worker
/// died mid-flight.
async fn make_zombie(harness: &Harness, execution_id: synapse_engine::ExecutionId) {
    let key = synapse_engine::store::keys::execution_state(execution_id);
    let raw = harness.runtime.store.get(&key).await.unwrap().unwrap();
    let mut state: synapse_engine::ExecutionState = serde_json::from_str(&raw).unwrap();
    state.status = ExecutionStatus::Executing;
    state.last_activity_at = chrono::Utc::now() - chrono::Duration::minutes(20);
    harness
        .runtime
        .store
        .put(&key, &serde_json::to_string(&state).unwrap(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failover_replan_books_alternative_time() {
    let registry = Arc::new(ToolRegistry::new());
    let (book, book_calls) = BookTableTool::new();
    registry.register(book);

    let mut harness = build_harness(test_config(), registry);
    let mut events_rx = harness.runtime.bus.subscribe();

    let intent = action_intent("book dinner at seven");
    let plan = sequential_plan(
        &intent,
        vec![(
            "book_restaurant_table",
            serde_json::json!({"time": "19:00", "party_size": 2}),
        )],
    );
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();

    harness.drive().await;

    // First attempt failed at 19:00, the replanner moved it to 20:00.
    let state = harness.runtime.get_execution(execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(book_calls.load(Ordering::SeqCst), 2);
    assert_eq!(state.plan_history.len(), 1);
    assert_eq!(
        state.plan.steps[0].parameters["time"],
        serde_json::json!("20:00")
    );
    // The rebased plan carries fresh step ids.
    assert_ne!(state.plan.steps[0].id, state.plan_history[0].steps[0].id);

    let events = collect_events(&harness, &mut events_rx).await;
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::FailoverPolicyTriggered));
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::AutomaticReplanTriggered));
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::ExecutionCompleted));
}

#[tokio::test]
async fn test_replan_marker_cleared_after_replan() {
    let registry = Arc::new(ToolRegistry::new());
    let (book, _calls) = BookTableTool::new();
    registry.register(book);

    let mut harness = build_harness(test_config(), registry);
    let intent = action_intent("book at seven");
    let plan = sequential_plan(
        &intent,
        vec![("book_restaurant_table", serde_json::json!({"time": "19:00"}))],
    );
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();

    // First segment fails and writes the marker.
    let job = harness.next_job().await.expect("initial job");
    harness.runtime.handle_job(&job).await.unwrap();
    let marker_key = synapse_engine::store::keys::replan_marker(execution_id);
    assert!(harness.runtime.store.get(&marker_key).await.unwrap().is_some());

    // The replan job consumes it.
    let replan_job = harness.next_job().await.expect("replan job");
    assert_eq!(replan_job.kind, synapse_engine::JobKind::Replan);
    harness.runtime.handle_job(&replan_job).await.unwrap();
    assert!(harness.runtime.store.get(&marker_key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dlq_parks_zombie_after_recovery_exhausted() {
    let registry = Arc::new(ToolRegistry::new());
    let (tool, _calls) = RecordingTool::new("noop", serde_json::json!({}));
    registry.register(tool);

    let mut config = test_config();
    config.dlq.max_recovery_attempts = 0;

    let harness = build_harness(config, registry);
    let intent = action_intent("will stall");
    let plan = sequential_plan(&intent, vec![("noop", serde_json::json!({}))]);
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();

    make_zombie(&harness, execution_id).await;

    let touched = harness.runtime.dlq.scan_once().await.unwrap();
    assert_eq!(touched, vec![execution_id]);

    let entry = harness.runtime.dlq.get(execution_id).await.unwrap();
    assert!(entry.requires_human_intervention);
    assert_eq!(entry.status_at_parking, ExecutionStatus::Executing);
    assert!(entry.inactive_duration_s >= 600);

    let stats = harness.runtime.dlq.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.requiring_human, 1);
}

#[tokio::test]
async fn test_dlq_auto_recovery_resumes_before_parking() {
    let registry = Arc::new(ToolRegistry::new());
    let (tool, calls) = RecordingTool::new("noop", serde_json::json!({}));
    registry.register(tool);

    let mut harness = build_harness(test_config(), registry);
    let intent = action_intent("stalls once");
    let plan = sequential_plan(&intent, vec![("noop", serde_json::json!({}))]);
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();

    // Drop the initial delivery on the floor (simulated crash) and stall.
    let _ = harness.next_job().await;
    make_zombie(&harness, execution_id).await;

    // Scan attempts automatic recovery by re-enqueueing from the cursor.
    let touched = harness.runtime.dlq.scan_once().await.unwrap();
    assert_eq!(touched, vec![execution_id]);
    assert!(harness.runtime.dlq.get(execution_id).await.is_err());

    harness.drive().await;
    let state = harness.runtime.get_execution(execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dlq_resume_completes_execution() {
    let registry = Arc::new(ToolRegistry::new());
    let (tool, _calls) = RecordingTool::new("noop", serde_json::json!({}));
    registry.register(tool);

    let mut config = test_config();
    config.dlq.max_recovery_attempts = 0;

    let mut harness = build_harness(config, registry);
    let intent = action_intent("restore me");
    let plan = sequential_plan(&intent, vec![("noop", serde_json::json!({}))]);
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();

    // Drop the initial delivery, stall, park.
    let _ = harness.next_job().await;
    make_zombie(&harness, execution_id).await;
    harness.runtime.dlq.scan_once().await.unwrap();
    assert!(harness.runtime.dlq.get(execution_id).await.is_ok());

    // Reason below the minimum is rejected.
    let rejected = harness
        .runtime
        .dlq
        .resume(
            execution_id,
            &DlqResumeRequest {
                fixed_parameters: None,
                skip_steps: None,
                resume_from_step: None,
                reason: "too short".into(),
                admin_user_id: "ops-1".into(),
            },
        )
        .await;
    assert!(rejected.is_err());

    harness
        .runtime
        .dlq
        .resume(
            execution_id,
            &DlqResumeRequest {
                fixed_parameters: None,
                skip_steps: None,
                resume_from_step: None,
                reason: "restored after incident".into(),
                admin_user_id: "ops-1".into(),
            },
        )
        .await
        .unwrap();

    harness.drive().await;

    let state = harness.runtime.get_execution(execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert!(harness.runtime.dlq.get(execution_id).await.is_err());
    assert_eq!(
        state.context["dlq_resume"]["admin_user_id"],
        serde_json::json!("ops-1")
    );
}

#[tokio::test]
async fn test_dlq_cancel_with_compensation() {
    let registry = Arc::new(ToolRegistry::new());
    let (book, _book_calls) = BookTableTool::new();
    let (cancel, cancel_calls, _params) = CancelReservationTool::new();
    let (ride, _ride_calls) = RecordingTool::with_delay(
        "request_ride",
        std::time::Duration::from_secs(30),
    );
    registry.register(book);
    registry.register(cancel);
    registry.register(ride);

    let mut config = test_config();
    config.dlq.max_recovery_attempts = 0;

    let mut harness = build_harness(config, registry);
    let intent = action_intent("book then stall");
    let plan = sequential_plan(
        &intent,
        vec![
            ("book_restaurant_table", serde_json::json!({"time": "20:00"})),
            ("request_ride", serde_json::json!({"to": "restaurant"})),
        ],
    );
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();

    // Complete step 0 (registers the compensation), then stall before step 1.
    let job = harness.next_job().await.expect("step 0 job");
    harness.runtime.handle_job(&job).await.unwrap();
    while harness.next_job().await.is_some() {}
    make_zombie(&harness, execution_id).await;
    harness.runtime.dlq.scan_once().await.unwrap();

    harness
        .runtime
        .dlq
        .cancel(
            execution_id,
            &DlqCancelRequest {
                reason: "stuck beyond repair".into(),
                admin_user_id: "ops-1".into(),
                attempt_compensation: true,
            },
        )
        .await
        .unwrap();

    // Compensation ran and the booking was cancelled.
    assert_eq!(cancel_calls.load(Ordering::SeqCst), 1);
    let state = harness.runtime.get_execution(execution_id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert!(harness.runtime.dlq.get(execution_id).await.is_err());

    let entries = harness.runtime.dlq.list(&DlqQuery::default()).await.unwrap();
    assert!(entries.is_empty());
}
