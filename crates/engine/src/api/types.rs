//! HTTP API request/response types

use serde::{Deserialize, Serialize};

use crate::engine::SegmentStepStatus;
use crate::types::{ExecutionId, ExecutionStatus, IntentType};

/// Standard error envelope
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

/// One chat message
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Caller location, when the client shares it
#[derive(Debug, Clone, Deserialize)]
pub struct UserLocation {
    pub lat: f64,
    pub lng: f64,
}

/// `POST /chat` request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub user_location: Option<UserLocation>,
}

/// `POST /chat` response for saga-class intents
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatExecutionResponse {
    pub success: bool,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub intent_type: IntentType,
}

/// `POST /chat` response for conversational intents
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTextResponse {
    pub success: bool,
    pub intent_type: IntentType,
    pub response: String,
}

/// `POST /engine/execute-step` response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteStepResponse {
    pub success: bool,
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_executed: Option<u32>,
    pub step_status: SegmentStepStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step_triggered: Option<bool>,
}

impl ExecuteStepResponse {
    pub fn from_report(report: &crate::engine::SegmentReport) -> Self {
        Self {
            success: true,
            execution_id: report.execution_id,
            step_executed: report.step_executed,
            step_status: report.step_status,
            completed_steps: report.completed_steps,
            total_steps: report.total_steps,
            is_complete: report.is_complete,
            next_step_triggered: Some(report.next_step_triggered),
        }
    }
}

/// `POST /mesh/resume` request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshResumeRequest {
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub force: Option<bool>,
}

/// `GET /executions/{id}` response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetailResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub intent_type: IntentType,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub segment_number: u32,
    pub plan_generations: usize,
    pub step_states: Vec<serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /executions/{id}/cancel` request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelExecutionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Generic acknowledgement
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

/// `GET /health` response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
}

/// `GET /dlq/sagas` query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqListQuery {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub min_inactive_minutes: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub sort_by: Option<crate::dlq::DlqSortField>,
    #[serde(default)]
    pub sort_order: Option<crate::dlq::SortOrder>,
}

/// `POST /dlq/sagas/{id}/resume` request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqResumeBody {
    #[serde(default)]
    pub fixed_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub skip_steps: Option<Vec<u32>>,
    #[serde(default)]
    pub resume_from_step: Option<u32>,
    pub reason: String,
    pub admin_user_id: String,
}

/// `POST /dlq/sagas/{id}/cancel` request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqCancelBody {
    pub reason: String,
    pub admin_user_id: String,
    #[serde(default)]
    pub attempt_compensation: bool,
}
