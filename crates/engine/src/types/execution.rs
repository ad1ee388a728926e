//! Execution state: the single durable record driven by the workflow machine
//!
//! Exactly one `ExecutionState` exists per execution id. All multi-field
//! mutations go through versioned writes; `version` strictly increases with
//! every successful store write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ExecutionId, Intent, Plan, StepId};

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Created,
    Planned,
    Executing,
    AwaitingResume,
    Compensating,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Created => "CREATED",
            ExecutionStatus::Planned => "PLANNED",
            ExecutionStatus::Executing => "EXECUTING",
            ExecutionStatus::AwaitingResume => "AWAITING_RESUME",
            ExecutionStatus::Compensating => "COMPENSATING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// Status of an individual step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Compensated,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Compensated => "compensated",
        };
        write!(f, "{}", s)
    }
}

/// Structured step error carried on the state record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
}

/// Per-step runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// The exact parameters the tool was invoked with
    pub input_snapshot: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default)]
    pub compensation_registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl StepState {
    pub fn pending(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            attempts: 0,
            input_snapshot: serde_json::Value::Null,
            output: None,
            error: None,
            compensation_registered: false,
            latency_ms: None,
        }
    }
}

/// A registered inverse action for a completed step.
///
/// Owns `{step_id, tool_name, parameters}` by value; no references back into
/// the plan, so the record survives plan replacement during replanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub step_id: StepId,
    /// Step number at registration time, used only for same-timestamp tie-breaks
    pub step_number: u32,
    pub tool_name: String,
    pub parameters: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CompensationOutcome>,
}

/// Result of playing back one compensation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Reason a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointReason {
    TimeoutApproaching,
    ExplicitPause,
    AwaitingHuman,
}

/// Durable cursor enabling resume across segments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    /// Next step number to execute on resume
    pub cursor: u32,
    pub segment_number: u32,
    pub reason: CheckpointReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The durable per-execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub intent: Intent,
    pub plan: Plan,
    pub status: ExecutionStatus,
    pub step_states: Vec<StepState>,
    /// Correlation data: user id, location, trace ids
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// OCC counter, mirrors the store-side version after every write
    pub version: u64,
    pub segment_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub compensations: Vec<CompensationRecord>,
    /// Superseded plans, newest last; populated by the replanner
    #[serde(default)]
    pub plan_history: Vec<Plan>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Create the initial record for a freshly planned execution.
    pub fn new(intent: Intent, plan: Plan) -> Self {
        let now = Utc::now();
        let step_states = plan.steps.iter().map(|s| StepState::pending(s.id)).collect();
        Self {
            execution_id: ExecutionId::new(),
            intent,
            plan,
            status: ExecutionStatus::Planned,
            step_states,
            context: HashMap::new(),
            version: 0,
            segment_number: 0,
            checkpoint: None,
            compensations: Vec::new(),
            plan_history: Vec::new(),
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    pub fn step_state(&self, step_id: StepId) -> Option<&StepState> {
        self.step_states.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_state_mut(&mut self, step_id: StepId) -> Option<&mut StepState> {
        self.step_states.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Number of steps in `completed` status.
    pub fn completed_steps(&self) -> usize {
        self.step_states
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// The lowest-numbered pending step whose dependencies are all completed.
    pub fn next_ready_step(&self) -> Option<&crate::types::PlanStep> {
        self.plan.steps.iter().find(|step| {
            let state = match self.step_state(step.id) {
                Some(s) => s,
                None => return false,
            };
            if state.status != StepStatus::Pending {
                return false;
            }
            step.dependencies.iter().all(|dep| {
                self.step_state(*dep)
                    .map(|d| matches!(d.status, StepStatus::Completed | StepStatus::Skipped))
                    .unwrap_or(false)
            })
        })
    }

    /// True when no step remains pending or running and none has failed.
    pub fn all_steps_finished(&self) -> bool {
        self.step_states.iter().all(|s| {
            matches!(
                s.status,
                StepStatus::Completed | StepStatus::Skipped
            )
        })
    }

    /// True when any step is in a failed state.
    pub fn has_failed_step(&self) -> bool {
        self.step_states.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Touch activity timestamps; called on every state transition.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.last_activity_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Intent, IntentType, Plan, PlanConstraints, PlanStep};

    fn two_step_state() -> ExecutionState {
        let intent = Intent::new(IntentType::Action, "dinner", "test");
        let s0 = PlanStep::new(0, "geocode_location", serde_json::json!({}));
        let s1 = PlanStep::new(1, "add_calendar_event", serde_json::json!({}))
            .with_dependencies(vec![s0.id]);
        let plan = Plan::new(intent.id, vec![s0, s1], PlanConstraints::default(), "t").unwrap();
        ExecutionState::new(intent, plan)
    }

    #[test]
    fn test_next_ready_step_honors_dependencies() {
        let mut state = two_step_state();
        let first = state.next_ready_step().unwrap().id;
        assert_eq!(first, state.plan.steps[0].id);

        // Until step 0 completes, step 1 is not ready even if 0 is running.
        state.step_states[0].status = StepStatus::Running;
        assert!(state.next_ready_step().is_none());

        state.step_states[0].status = StepStatus::Completed;
        let second = state.next_ready_step().unwrap().id;
        assert_eq!(second, state.plan.steps[1].id);
    }

    #[test]
    fn test_skipped_dependency_counts_as_satisfied() {
        let mut state = two_step_state();
        state.step_states[0].status = StepStatus::Skipped;
        assert_eq!(
            state.next_ready_step().unwrap().id,
            state.plan.steps[1].id
        );
    }

    #[test]
    fn test_all_steps_finished() {
        let mut state = two_step_state();
        assert!(!state.all_steps_finished());
        state.step_states[0].status = StepStatus::Completed;
        state.step_states[1].status = StepStatus::Skipped;
        assert!(state.all_steps_finished());
    }

    #[test]
    fn test_serde_round_trip_preserves_fields() {
        let state = two_step_state();
        let json = serde_json::to_string(&state).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::AwaitingResume.is_terminal());
        assert!(!ExecutionStatus::Compensating.is_terminal());
    }
}
