//! HTTP API route handlers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use std::sync::Arc;

use super::middleware::verify_bearer;
use super::types::*;
use crate::dlq::{DlqCancelRequest, DlqQuery, DlqResumeRequest};
use crate::queue::{verify_signature, ContinuationJob, SIGNATURE_HEADER};
use crate::trace::TraceContext;
use crate::types::{
    DlqError, EngineError, ExecutionId, LockError, QueueError,
};
use crate::{ChatOutcome, SynapseRuntime};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(error: &EngineError) -> ApiError {
    let (status, code) = match error {
        EngineError::ExecutionNotFound { .. } => (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND"),
        EngineError::Lock(LockError::Held { .. }) => (StatusCode::CONFLICT, "LOCK_HELD"),
        EngineError::Queue(QueueError::SignatureInvalid(_)) => {
            (StatusCode::UNAUTHORIZED, "SIGNATURE_INVALID")
        }
        EngineError::Dlq(DlqError::EntryNotFound { .. }) => {
            (StatusCode::NOT_FOUND, "DLQ_ENTRY_NOT_FOUND")
        }
        EngineError::Dlq(DlqError::ResumeRejected { .. })
        | EngineError::Dlq(DlqError::CancelRejected { .. }) => {
            (StatusCode::BAD_REQUEST, "DLQ_REQUEST_REJECTED")
        }
        EngineError::Plan(_) => (StatusCode::BAD_REQUEST, "PLAN_REJECTED"),
        EngineError::Store(crate::types::StoreError::VersionConflict { .. }) => {
            (StatusCode::CONFLICT, "CONFLICT")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
            details: None,
        }),
    )
}

fn bad_request(message: &str, details: Vec<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "SCHEMA_VALIDATION_FAILED".to_string(),
            details: Some(details),
        }),
    )
}

fn unauthorized() -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "unauthorized".to_string(),
            code: "UNAUTHORIZED".to_string(),
            details: None,
        }),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn trace_from_headers(headers: &HeaderMap) -> TraceContext {
    let pairs: Vec<(&str, &str)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();
    TraceContext::from_headers(pairs)
}

/// Chat entry point: parse, plan, enqueue.
pub async fn chat(
    State(runtime): State<Arc<SynapseRuntime>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let last_user_message = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .ok_or_else(|| {
            bad_request(
                "request body failed validation",
                vec!["messages: must contain at least one user message".into()],
            )
        })?;

    let mut context = std::collections::HashMap::new();
    if let Some(location) = &request.user_location {
        context.insert(
            "location".to_string(),
            serde_json::json!({"lat": location.lat, "lng": location.lng}),
        );
    }

    let trace = trace_from_headers(&headers);
    let outcome = runtime
        .chat(&last_user_message.content, context, &trace)
        .await
        .map_err(|e| error_response(&e))?;

    let value = match outcome {
        ChatOutcome::Execution {
            execution_id,
            status,
            intent_type,
        } => serde_json::to_value(ChatExecutionResponse {
            success: true,
            execution_id,
            status,
            intent_type,
        }),
        ChatOutcome::Conversational { intent_type, reply } => {
            serde_json::to_value(ChatTextResponse {
                success: true,
                intent_type,
                response: reply,
            })
        }
    }
    .unwrap_or_default();
    Ok(Json(value))
}

/// Segment execution endpoint: the queue's delivery target and the internal
/// direct-call surface. Authenticated by delivery signature or internal key.
pub async fn execute_step(
    State(runtime): State<Arc<SynapseRuntime>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ExecuteStepResponse>, ApiError> {
    let api_config = &runtime.config.api;
    let signature = header_str(&headers, SIGNATURE_HEADER);
    let internal_key = header_str(&headers, "x-internal-system-key");

    let authorized = match (signature, &runtime.config.queue.signing_secret) {
        (Some(sig), Some(secret)) => verify_signature(secret.as_bytes(), &body, sig).is_ok(),
        _ => false,
    } || match (internal_key, &api_config.internal_system_key) {
        (Some(presented), Some(expected)) => super::middleware::secrets_match(presented, expected),
        _ => false,
    } || !api_config.require_queue_signature;

    if !authorized {
        return Err(unauthorized());
    }

    let mut job: ContinuationJob = serde_json::from_slice(&body)
        .map_err(|e| bad_request("request body failed validation", vec![e.to_string()]))?;
    if job.trace.is_none() {
        job.trace = Some(trace_from_headers(&headers));
    }

    let report = runtime
        .handle_job(&job)
        .await
        .map_err(|e| error_response(&e))?;

    match report {
        Some(report) => Ok(Json(ExecuteStepResponse::from_report(&report))),
        None => {
            // Replan jobs return a synthetic summary of the rebased execution.
            let state = runtime
                .get_execution(job.execution_id)
                .await
                .map_err(|e| error_response(&e))?;
            Ok(Json(ExecuteStepResponse {
                success: true,
                execution_id: state.execution_id,
                step_executed: None,
                step_status: crate::engine::SegmentStepStatus::Pending,
                completed_steps: state.completed_steps(),
                total_steps: state.plan.steps.len(),
                is_complete: false,
                next_step_triggered: Some(true),
            }))
        }
    }
}

/// Service-mesh resume from checkpoint. Requires the service bearer token.
pub async fn mesh_resume(
    State(runtime): State<Arc<SynapseRuntime>>,
    headers: HeaderMap,
    Json(request): Json<MeshResumeRequest>,
) -> Result<Json<ExecuteStepResponse>, ApiError> {
    let authorization = header_str(&headers, "authorization");
    if !verify_bearer(authorization, runtime.config.api.service_token.as_deref()) {
        return Err(unauthorized());
    }
    let trace = match &request.trace_id {
        Some(trace_id) => TraceContext {
            trace_id: trace_id.clone(),
            ..TraceContext::new()
        },
        None => trace_from_headers(&headers),
    };
    let report = runtime
        .resume_from_checkpoint(request.execution_id, &trace)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ExecuteStepResponse::from_report(&report)))
}

/// Execution detail.
pub async fn get_execution(
    State(runtime): State<Arc<SynapseRuntime>>,
    Path(execution_id): Path<ExecutionId>,
) -> Result<Json<ExecutionDetailResponse>, ApiError> {
    let state = runtime
        .get_execution(execution_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ExecutionDetailResponse {
        execution_id: state.execution_id,
        status: state.status,
        intent_type: state.intent.intent_type,
        completed_steps: state.completed_steps(),
        total_steps: state.plan.steps.len(),
        segment_number: state.segment_number,
        plan_generations: state.plan_history.len() + 1,
        step_states: state
            .step_states
            .iter()
            .map(|s| serde_json::to_value(s).unwrap_or_default())
            .collect(),
        created_at: state.created_at,
        updated_at: state.updated_at,
    }))
}

/// Cooperative cancellation of an execution.
pub async fn cancel_execution(
    State(runtime): State<Arc<SynapseRuntime>>,
    Path(execution_id): Path<ExecutionId>,
    headers: HeaderMap,
    Json(request): Json<CancelExecutionRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let trace = trace_from_headers(&headers);
    runtime
        .cancel_execution(
            execution_id,
            request.reason.as_deref().unwrap_or("requested by caller"),
            &trace,
        )
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(AckResponse {
        success: true,
        message: "cancellation tombstone written".into(),
    }))
}

/// DLQ listing.
pub async fn dlq_list(
    State(runtime): State<Arc<SynapseRuntime>>,
    Query(query): Query<DlqListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = runtime
        .dlq
        .list(&DlqQuery {
            status: query.status,
            min_inactive_minutes: query.min_inactive_minutes,
            limit: query.limit,
            offset: query.offset,
            sort_by: query.sort_by,
            sort_order: query.sort_order,
        })
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(serde_json::json!({
        "success": true,
        "count": entries.len(),
        "sagas": entries,
    })))
}

/// DLQ statistics.
pub async fn dlq_stats(
    State(runtime): State<Arc<SynapseRuntime>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = runtime.dlq.stats().await.map_err(|e| error_response(&e))?;
    Ok(Json(serde_json::json!({ "success": true, "stats": stats })))
}

/// DLQ entry detail.
pub async fn dlq_get(
    State(runtime): State<Arc<SynapseRuntime>>,
    Path(execution_id): Path<ExecutionId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = runtime
        .dlq
        .get(execution_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(serde_json::json!({ "success": true, "saga": entry })))
}

/// DLQ resume.
pub async fn dlq_resume(
    State(runtime): State<Arc<SynapseRuntime>>,
    Path(execution_id): Path<ExecutionId>,
    Json(body): Json<DlqResumeBody>,
) -> Result<Json<AckResponse>, ApiError> {
    if body.reason.trim().len() < 10 {
        return Err(bad_request(
            "request body failed validation",
            vec!["reason: must be at least 10 characters".into()],
        ));
    }
    runtime
        .dlq
        .resume(
            execution_id,
            &DlqResumeRequest {
                fixed_parameters: body.fixed_parameters,
                skip_steps: body.skip_steps,
                resume_from_step: body.resume_from_step,
                reason: body.reason,
                admin_user_id: body.admin_user_id,
            },
        )
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(AckResponse {
        success: true,
        message: "execution resumed from DLQ".into(),
    }))
}

/// DLQ cancel.
pub async fn dlq_cancel(
    State(runtime): State<Arc<SynapseRuntime>>,
    Path(execution_id): Path<ExecutionId>,
    Json(body): Json<DlqCancelBody>,
) -> Result<Json<AckResponse>, ApiError> {
    runtime
        .dlq
        .cancel(
            execution_id,
            &DlqCancelRequest {
                reason: body.reason,
                admin_user_id: body.admin_user_id,
                attempt_compensation: body.attempt_compensation,
            },
        )
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(AckResponse {
        success: true,
        message: "execution cancelled from DLQ".into(),
    }))
}

/// Liveness probe.
pub async fn health(
    State(runtime): State<Arc<SynapseRuntime>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        uptime_seconds: runtime.uptime().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
