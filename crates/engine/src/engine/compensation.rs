//! Saga compensator: reverse-order unwinding of completed side effects
//!
//! Runs when a terminal step failure leaves registered compensations behind.
//! Compensations execute strictly in reverse registration order (ties broken
//! by step number descending), continue past individual failures, and the
//! execution ends in FAILED either way.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::repository::ExecutionRepository;
use crate::cancel::CancelToken;
use crate::events::{EventType, OutboxWriter, SagaEvent};
use crate::tools::ToolExecutor;
use crate::trace::TraceContext;
use crate::types::{
    CompensationOutcome, EngineResult, ExecutionId, ExecutionStatus, StepId,
};

/// Authoritative table of which tools require compensation.
///
/// Seeded from name-pattern defaults (`book_*`, `reserve_*`, `request_*`,
/// `create_*`) but the registry is the single source of truth: explicit
/// entries always win over the patterns.
pub struct CompensationPolicy {
    explicit: dashmap::DashMap<String, bool>,
    default_patterns: Vec<String>,
}

impl CompensationPolicy {
    pub fn new() -> Self {
        Self {
            explicit: dashmap::DashMap::new(),
            default_patterns: vec![
                "book_".to_string(),
                "reserve_".to_string(),
                "request_".to_string(),
                "create_".to_string(),
            ],
        }
    }

    /// Explicitly mark a tool as needing (or not needing) compensation.
    pub fn set(&self, tool_name: &str, needs_compensation: bool) {
        self.explicit
            .insert(tool_name.to_string(), needs_compensation);
    }

    pub fn needs_compensation(&self, tool_name: &str) -> bool {
        if let Some(entry) = self.explicit.get(tool_name) {
            return *entry;
        }
        self.default_patterns
            .iter()
            .any(|p| tool_name.starts_with(p.as_str()))
    }
}

impl Default for CompensationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of one compensation pass, recorded on the execution context.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompensationSummary {
    pub attempted: usize,
    pub succeeded: Vec<StepId>,
    pub failed: Vec<StepId>,
    pub skipped: Vec<StepId>,
}

pub struct SagaCompensator {
    repository: Arc<ExecutionRepository>,
    executor: Arc<ToolExecutor>,
    outbox: Arc<OutboxWriter>,
    policy: Arc<CompensationPolicy>,
    timeout: Duration,
}

impl SagaCompensator {
    pub fn new(
        repository: Arc<ExecutionRepository>,
        executor: Arc<ToolExecutor>,
        outbox: Arc<OutboxWriter>,
        policy: Arc<CompensationPolicy>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            executor,
            outbox,
            policy,
            timeout,
        }
    }

    /// Unwind registered compensations and mark the execution FAILED.
    pub async fn compensate(
        &self,
        execution_id: ExecutionId,
        trace: &TraceContext,
    ) -> EngineResult<CompensationSummary> {
        let state = self
            .repository
            .update(execution_id, |s| {
                s.status = ExecutionStatus::Compensating;
                Ok(())
            })
            .await?;

        // Reverse registration order; same-timestamp ties break by step
        // number descending.
        let mut records = state.compensations.clone();
        records.sort_by(|a, b| {
            b.registered_at
                .cmp(&a.registered_at)
                .then(b.step_number.cmp(&a.step_number))
        });

        let mut summary = CompensationSummary {
            attempted: records.len(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        };

        for record in &records {
            let outcome = if !self.policy.needs_compensation(&record.tool_name) {
                tracing::debug!(
                    execution_id = %execution_id,
                    tool_name = %record.tool_name,
                    "compensation skipped, tool is idempotent"
                );
                CompensationOutcome::Skipped
            } else {
                let result = self
                    .executor
                    .execute(
                        &record.tool_name,
                        record.parameters.clone(),
                        self.timeout,
                        CancelToken::never(),
                    )
                    .await;
                if result.ok {
                    CompensationOutcome::Succeeded
                } else {
                    tracing::warn!(
                        execution_id = %execution_id,
                        tool_name = %record.tool_name,
                        error = ?result.error,
                        "compensation failed, continuing with the rest"
                    );
                    CompensationOutcome::Failed
                }
            };

            match outcome {
                CompensationOutcome::Succeeded => summary.succeeded.push(record.step_id),
                CompensationOutcome::Failed => summary.failed.push(record.step_id),
                CompensationOutcome::Skipped => summary.skipped.push(record.step_id),
            }

            let step_id = record.step_id;
            self.repository
                .update(execution_id, |s| {
                    if let Some(r) = s.compensations.iter_mut().find(|r| r.step_id == step_id) {
                        r.executed_at = Some(Utc::now());
                        r.outcome = Some(outcome);
                    }
                    if let Some(step) = s.step_state_mut(step_id) {
                        if outcome == CompensationOutcome::Succeeded {
                            step.status = crate::types::StepStatus::Compensated;
                        }
                    }
                    Ok(())
                })
                .await?;

            if outcome != CompensationOutcome::Skipped {
                self.outbox
                    .append(
                        &SagaEvent::new(EventType::CompensationExecuted, execution_id)
                            .with_step(step_id)
                            .with_status(match outcome {
                                CompensationOutcome::Succeeded => "succeeded",
                                CompensationOutcome::Failed => "failed",
                                CompensationOutcome::Skipped => "skipped",
                            })
                            .with_trace_id(&trace.trace_id),
                    )
                    .await
                    .map_err(crate::types::EngineError::Store)?;
            }
        }

        let summary_value = serde_json::to_value(&summary)
            .unwrap_or(serde_json::Value::Null);
        self.repository
            .update(execution_id, move |s| {
                s.status = ExecutionStatus::Failed;
                s.context
                    .insert("compensation_summary".to_string(), summary_value.clone());
                Ok(())
            })
            .await?;

        self.outbox
            .append(
                &SagaEvent::new(EventType::ExecutionFailed, execution_id)
                    .with_status("FAILED")
                    .with_message("execution failed, compensations played back")
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(crate::types::EngineError::Store)?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_pattern_defaults() {
        let policy = CompensationPolicy::new();
        assert!(policy.needs_compensation("book_restaurant_table"));
        assert!(policy.needs_compensation("reserve_court"));
        assert!(!policy.needs_compensation("geocode_location"));
        assert!(!policy.needs_compensation("send_notification"));
    }

    #[test]
    fn test_explicit_entry_overrides_pattern() {
        let policy = CompensationPolicy::new();
        policy.set("book_free_slot", false);
        policy.set("send_payment", true);
        assert!(!policy.needs_compensation("book_free_slot"));
        assert!(policy.needs_compensation("send_payment"));
    }
}
