//! HTTP surface tests: auth, status codes, and response shapes

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use common::*;
use synapse_engine::queue::{sign_body, SIGNATURE_HEADER};
use synapse_engine::{ToolRegistry, TraceContext};

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

fn secured_config() -> synapse_engine::Config {
    let mut config = test_config();
    config.api.require_queue_signature = true;
    config.queue.signing_secret = Some("test-secret".to_string());
    config.api.internal_system_key = Some("internal-key".to_string());
    config.api.service_token = Some("svc-token".to_string());
    config.api.enable_rate_limiting = false;
    config
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = build_harness(test_config(), Arc::new(ToolRegistry::new()));
    let router = synapse_engine::api::build_router(Arc::clone(&harness.runtime));

    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_execute_step_rejects_unsigned_delivery() {
    let harness = build_harness(secured_config(), Arc::new(ToolRegistry::new()));
    let router = synapse_engine::api::build_router(Arc::clone(&harness.runtime));

    let body = serde_json::json!({
        "executionId": "6f9a4a3e-26a7-4bcd-9b8e-1f55aa0d9e11",
        "startStepIndex": 0
    })
    .to_string();
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/engine/execute-step")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_execute_step_with_signature_and_unknown_execution() {
    let harness = build_harness(secured_config(), Arc::new(ToolRegistry::new()));
    let router = synapse_engine::api::build_router(Arc::clone(&harness.runtime));

    let body = serde_json::json!({
        "executionId": "6f9a4a3e-26a7-4bcd-9b8e-1f55aa0d9e11",
        "startStepIndex": 0
    })
    .to_string();
    let signature = sign_body(b"test-secret", body.as_bytes()).unwrap();
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/engine/execute-step")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    // Signature accepted, execution does not exist.
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_execute_step_with_internal_key_runs_segment() {
    let registry = Arc::new(ToolRegistry::new());
    let (tool, _calls) = RecordingTool::new("noop", serde_json::json!({}));
    registry.register(tool);

    let harness = build_harness(secured_config(), registry);
    let intent = action_intent("api driven");
    let plan = sequential_plan(&intent, vec![("noop", serde_json::json!({}))]);
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();

    let router = synapse_engine::api::build_router(Arc::clone(&harness.runtime));
    let body = serde_json::json!({
        "executionId": execution_id,
        "startStepIndex": 0
    })
    .to_string();
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/engine/execute-step")
                .header("content-type", "application/json")
                .header("x-internal-system-key", "internal-key")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["stepExecuted"], 0);
    assert_eq!(json["stepStatus"], "completed");
    assert_eq!(json["isComplete"], true);
    assert_eq!(json["totalSteps"], 1);
}

#[tokio::test]
async fn test_mesh_resume_requires_bearer() {
    let harness = build_harness(secured_config(), Arc::new(ToolRegistry::new()));
    let router = synapse_engine::api::build_router(Arc::clone(&harness.runtime));

    let body = serde_json::json!({
        "executionId": "6f9a4a3e-26a7-4bcd-9b8e-1f55aa0d9e11"
    })
    .to_string();
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mesh/resume")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_execution_detail_and_dlq_listing() {
    let registry = Arc::new(ToolRegistry::new());
    let (tool, _calls) = RecordingTool::new("noop", serde_json::json!({}));
    registry.register(tool);

    let mut harness = build_harness(secured_config(), registry);
    let intent = action_intent("inspect me");
    let plan = sequential_plan(&intent, vec![("noop", serde_json::json!({}))]);
    let execution_id = harness
        .runtime
        .start_execution(intent, plan, HashMap::new(), &TraceContext::new())
        .await
        .unwrap();
    harness.drive().await;

    let router = synapse_engine::api::build_router(Arc::clone(&harness.runtime));
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/executions/{execution_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "COMPLETED");
    assert_eq!(json["completedSteps"], 1);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/dlq/sagas?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["count"], 0);
}

#[tokio::test]
async fn test_chat_rejects_empty_messages() {
    let harness = build_harness(secured_config(), Arc::new(ToolRegistry::new()));
    let router = synapse_engine::api::build_router(Arc::clone(&harness.runtime));

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"messages": []}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "SCHEMA_VALIDATION_FAILED");
}
