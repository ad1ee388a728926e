//! Replanner: turns a failover recommendation into a fresh plan
//!
//! Consumes the replan marker written by the workflow machine, asks the
//! external planner for a new plan with the failover suggestions injected as
//! structural constraints, rebases the execution onto the new plan, and
//! resumes at step 0. The superseded plan moves to `plan_history`; its
//! completed side effects stay owned by the compensator should the new plan
//! fail later.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::FailoverDecision;
use crate::config::EngineConfig;
use crate::engine::repository::ExecutionRepository;
use crate::events::{EventType, OutboxWriter, SagaEvent};
use crate::queue::{ContinuationJob, JobQueue};
use crate::store::{keys, StateStore};
use crate::trace::TraceContext;
use crate::types::{
    EngineError, EngineResult, ExecutionId, ExecutionStatus, Intent, Plan, PlanConstraints,
    ReplanError, StepId, StepState, StoreError,
};

/// Marker written by the workflow machine when a failure is recoverable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanMarker {
    pub execution_id: ExecutionId,
    pub failed_step_id: StepId,
    pub failed_step_number: u32,
    pub decision: FailoverDecision,
    pub created_at: DateTime<Utc>,
}

/// Constraints handed to the external planner on a replan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConstraints {
    pub base: PlanConstraints,
    /// Structural suggestions from the failover engine; the planner applies
    /// them to the relevant step parameters
    pub suggestions: Vec<super::Suggestion>,
    /// The plan being replaced, for context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_plan: Option<Plan>,
}

/// External plan synthesis. The engine delegates; only the contract lives here.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        intent: &Intent,
        constraints: &PlanningConstraints,
    ) -> Result<Plan, String>;
}

pub struct Replanner {
    repository: Arc<ExecutionRepository>,
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    planner: Arc<dyn Planner>,
    outbox: Arc<OutboxWriter>,
    config: EngineConfig,
}

impl Replanner {
    pub fn new(
        repository: Arc<ExecutionRepository>,
        store: Arc<dyn StateStore>,
        queue: Arc<dyn JobQueue>,
        planner: Arc<dyn Planner>,
        outbox: Arc<OutboxWriter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            store,
            queue,
            planner,
            outbox,
            config,
        }
    }

    /// Write the replan marker. Called by the workflow machine before it
    /// enqueues the replan job.
    pub async fn write_marker(&self, marker: &ReplanMarker) -> EngineResult<()> {
        let value = serde_json::to_string(marker)
            .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
        self.store
            .put(
                &keys::replan_marker(marker.execution_id),
                &value,
                Some(Duration::from_secs(self.config.replan_marker_ttl_s)),
            )
            .await
            .map_err(EngineError::Store)?;
        Ok(())
    }

    /// Consume the marker and rebase the execution onto a new plan.
    pub async fn replan(&self, execution_id: ExecutionId, trace: &TraceContext) -> EngineResult<()> {
        let marker_key = keys::replan_marker(execution_id);
        let marker: ReplanMarker = match self.store.get(&marker_key).await.map_err(EngineError::Store)? {
            Some(value) => serde_json::from_str(&value)
                .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?,
            None => {
                return Err(EngineError::Replan(ReplanError::MarkerMissing {
                    execution_id,
                }))
            }
        };

        let state = self.repository.load_required(execution_id).await?;
        if state.status.is_terminal() {
            let _ = self.store.delete(&marker_key).await;
            return Ok(());
        }

        let constraints = PlanningConstraints {
            base: state.plan.constraints.clone(),
            suggestions: marker.decision.suggestions.clone(),
            previous_plan: Some(state.plan.clone()),
        };
        let new_plan = self
            .planner
            .plan(&state.intent, &constraints)
            .await
            .map_err(|e| EngineError::Replan(ReplanError::PlannerFailed(e)))?;
        new_plan
            .validate()
            .map_err(|e| EngineError::Replan(ReplanError::PlanRejected(e)))?;

        // Old step locks are keyed by index; clear them so the rebased plan
        // can execute from step 0 without colliding with the failed attempt.
        for index in 0..state.plan.steps.len() as u32 {
            let _ = self
                .store
                .delete(&keys::step_lock(execution_id, index))
                .await;
        }

        let plan_for_update = new_plan.clone();
        self.repository
            .update(execution_id, move |s| {
                let old_plan = std::mem::replace(&mut s.plan, plan_for_update.clone());
                s.plan_history.push(old_plan);
                s.step_states = plan_for_update
                    .steps
                    .iter()
                    .map(|step| StepState::pending(step.id))
                    .collect();
                s.status = ExecutionStatus::Planned;
                s.checkpoint = None;
                Ok(())
            })
            .await?;

        self.store
            .delete(&marker_key)
            .await
            .map_err(EngineError::Store)?;

        self.outbox
            .append(
                &SagaEvent::new(EventType::AutomaticReplanTriggered, execution_id)
                    .with_status("PLANNED")
                    .with_message(&format!(
                        "replanned after {:?} via policy {}",
                        marker.decision.reason,
                        marker.decision.policy.as_deref().unwrap_or("unmatched")
                    ))
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;

        self.queue
            .enqueue(ContinuationJob::continuation(
                execution_id,
                0,
                0,
                trace.child(),
            ))
            .await
            .map_err(EngineError::Queue)?;

        tracing::info!(
            execution_id = %execution_id,
            policy = marker.decision.policy.as_deref().unwrap_or("unmatched"),
            "execution rebased onto new plan"
        );
        Ok(())
    }
}

/// Planner that rebuilds the previous plan with suggestions applied
/// structurally to matching step parameters. Serves single-node deployments
/// and tests; production wires the LLM planning service instead.
pub struct SuggestionPlanner;

#[async_trait]
impl Planner for SuggestionPlanner {
    async fn plan(
        &self,
        intent: &Intent,
        constraints: &PlanningConstraints,
    ) -> Result<Plan, String> {
        let previous = constraints
            .previous_plan
            .as_ref()
            .ok_or_else(|| "no previous plan to rebuild".to_string())?;
        let steps = previous
            .steps
            .iter()
            .map(|step| {
                // Fresh step ids; same tools, suggested parameters folded in.
                let mut rebuilt = crate::types::PlanStep::new(
                    step.step_number,
                    &step.tool_name,
                    step.parameters.clone(),
                )
                .with_description(&step.description)
                .with_timeout_ms(step.timeout_ms);
                if let serde_json::Value::Object(params) = &mut rebuilt.parameters {
                    for suggestion in &constraints.suggestions {
                        if params.contains_key(&suggestion.parameter) {
                            params.insert(suggestion.parameter.clone(), suggestion.value.clone());
                        }
                    }
                }
                rebuilt
            })
            .collect();
        // Dependencies are re-derived from the linear order, matching how the
        // external planner emits sequential plans.
        let plan = Plan::new(
            intent.id,
            relink_sequential(steps),
            constraints.base.clone(),
            &previous.summary,
        )
        .map_err(|e| e.to_string())?;
        Ok(plan)
    }
}

/// Give each step a dependency on its predecessor.
fn relink_sequential(mut steps: Vec<crate::types::PlanStep>) -> Vec<crate::types::PlanStep> {
    steps.sort_by_key(|s| s.step_number);
    let ids: Vec<crate::types::StepId> = steps.iter().map(|s| s.id).collect();
    for (index, step) in steps.iter_mut().enumerate() {
        step.dependencies = if index == 0 {
            Vec::new()
        } else {
            vec![ids[index - 1]]
        };
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::Suggestion;
    use crate::types::{IntentType, PlanStep};

    #[tokio::test]
    async fn test_suggestion_planner_applies_suggestions_with_fresh_ids() {
        let intent = Intent::new(IntentType::Action, "book dinner", "test");
        let step = PlanStep::new(
            0,
            "book_restaurant_table",
            serde_json::json!({"time": "19:00", "party_size": 4}),
        );
        let old_id = step.id;
        let previous = Plan::new(intent.id, vec![step], PlanConstraints::default(), "book").unwrap();

        let constraints = PlanningConstraints {
            base: PlanConstraints::default(),
            suggestions: vec![Suggestion {
                parameter: "time".into(),
                value: serde_json::json!("20:00"),
            }],
            previous_plan: Some(previous),
        };
        let plan = SuggestionPlanner.plan(&intent, &constraints).await.unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_ne!(plan.steps[0].id, old_id);
        assert_eq!(plan.steps[0].parameters["time"], serde_json::json!("20:00"));
        assert_eq!(plan.steps[0].parameters["party_size"], serde_json::json!(4));
    }

    #[tokio::test]
    async fn test_suggestions_only_touch_existing_parameters() {
        let intent = Intent::new(IntentType::Action, "geocode", "test");
        let step = PlanStep::new(0, "geocode_location", serde_json::json!({"query": "x"}));
        let previous =
            Plan::new(intent.id, vec![step], PlanConstraints::default(), "geo").unwrap();
        let constraints = PlanningConstraints {
            base: PlanConstraints::default(),
            suggestions: vec![Suggestion {
                parameter: "time".into(),
                value: serde_json::json!("20:00"),
            }],
            previous_plan: Some(previous),
        };
        let plan = SuggestionPlanner.plan(&intent, &constraints).await.unwrap();
        assert!(plan.steps[0].parameters.get("time").is_none());
    }
}
