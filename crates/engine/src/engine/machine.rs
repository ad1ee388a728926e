//! Workflow machine: drives one step per segment under a wall-clock budget
//!
//! Per-invocation protocol:
//! duplicate pre-check → coarse lock → load state → tombstone check →
//! select next ready step → budget check → step idempotency lock →
//! mark running → invoke tool (bounded, cancellable) → record result →
//! chain the next segment (directly or via checkpoint) → release.
//!
//! The machine never retries a logical failure itself: the tool executor has
//! already retried technical errors, so a failure here goes to the failover
//! engine (recoverable → replan marker) or to the compensator (terminal).

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::checkpoint::CheckpointManager;
use super::compensation::SagaCompensator;
use super::repository::ExecutionRepository;
use crate::cancel::CancelSource;
use crate::config::EngineConfig;
use crate::events::{EventType, OutboxWriter, SagaEvent};
use crate::failover::{FailoverContext, FailoverPolicyEngine, ReplanMarker, Replanner};
use crate::queue::{ContinuationJob, JobQueue};
use crate::store::{keys, LockManager};
use crate::tools::ToolExecutor;
use crate::trace::TraceContext;
use crate::types::{
    CheckpointReason, CompensationRecord, EngineError, EngineResult, ExecutionId, ExecutionState,
    ExecutionStatus, PlanStep, StepStatus,
};

/// Step-level outcome of one segment, in wire vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStepStatus {
    Completed,
    Failed,
    Pending,
    NoStepsRemaining,
}

/// What one segment did
#[derive(Debug, Clone)]
pub struct SegmentReport {
    pub execution_id: ExecutionId,
    pub step_executed: Option<u32>,
    pub step_status: SegmentStepStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub is_complete: bool,
    pub next_step_triggered: bool,
    pub status: ExecutionStatus,
    /// True when this delivery was recognized as a queue retry
    pub duplicate_delivery: bool,
}

impl SegmentReport {
    fn from_state(state: &ExecutionState) -> Self {
        Self {
            execution_id: state.execution_id,
            step_executed: None,
            step_status: SegmentStepStatus::NoStepsRemaining,
            completed_steps: state.completed_steps(),
            total_steps: state.plan.steps.len(),
            is_complete: state.status == ExecutionStatus::Completed,
            next_step_triggered: false,
            status: state.status,
            duplicate_delivery: false,
        }
    }
}

pub struct WorkflowMachine {
    repository: Arc<ExecutionRepository>,
    locks: Arc<LockManager>,
    executor: Arc<ToolExecutor>,
    checkpoints: Arc<CheckpointManager>,
    compensator: Arc<SagaCompensator>,
    failover: Arc<FailoverPolicyEngine>,
    replanner: Arc<Replanner>,
    queue: Arc<dyn JobQueue>,
    outbox: Arc<OutboxWriter>,
    config: EngineConfig,
}

impl WorkflowMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<ExecutionRepository>,
        locks: Arc<LockManager>,
        executor: Arc<ToolExecutor>,
        checkpoints: Arc<CheckpointManager>,
        compensator: Arc<SagaCompensator>,
        failover: Arc<FailoverPolicyEngine>,
        replanner: Arc<Replanner>,
        queue: Arc<dyn JobQueue>,
        outbox: Arc<OutboxWriter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            locks,
            executor,
            checkpoints,
            compensator,
            failover,
            replanner,
            queue,
            outbox,
            config,
        }
    }

    /// Execute one segment. `start_step_index` is the index the queue job was
    /// addressed to; admin resumes may omit it.
    pub async fn execute_segment(
        &self,
        execution_id: ExecutionId,
        start_step_index: Option<u32>,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        let segment_started = Instant::now();

        // Queue retry fast path: the step lock proves this (execution, index)
        // was already attempted.
        if let Some(index) = start_step_index {
            let held = self
                .locks
                .is_held(&keys::step_lock(execution_id, index))
                .await
                .map_err(EngineError::Store)?;
            if held {
                let state = self.repository.load_required(execution_id).await?;
                tracing::info!(
                    execution_id = %execution_id,
                    step_index = index,
                    "duplicate delivery, step lock already held"
                );
                let mut report = SegmentReport::from_state(&state);
                report.duplicate_delivery = true;
                return Ok(report);
            }
        }

        let coarse = self
            .locks
            .acquire(
                &keys::coarse_lock(execution_id),
                Duration::from_secs(self.config.coarse_lock_ttl_s),
            )
            .await
            .map_err(EngineError::Lock)?;

        let result = self
            .run_locked_segment(execution_id, segment_started, trace)
            .await;

        // Coarse lock released whatever happened; step locks persist.
        self.locks.release(coarse).await;
        result
    }

    async fn run_locked_segment(
        &self,
        execution_id: ExecutionId,
        segment_started: Instant,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        let state = self.repository.load_required(execution_id).await?;

        if self.repository.is_cancelled(execution_id).await? {
            return self.finish_cancelled(state, trace).await;
        }

        if state.status.is_terminal() {
            return Ok(SegmentReport::from_state(&state));
        }

        if state.status == ExecutionStatus::AwaitingResume {
            // A replan is pending; this segment has nothing to run.
            return Ok(SegmentReport::from_state(&state));
        }

        let step = match state.next_ready_step() {
            Some(step) => step.clone(),
            None => {
                if state.all_steps_finished() {
                    return self.complete_execution(state, trace).await;
                }
                if state.has_failed_step() {
                    return Ok(SegmentReport::from_state(&state));
                }
                return Err(EngineError::Internal(format!(
                    "execution {execution_id} has pending steps but none are ready"
                )));
            }
        };

        // Budget guard: with less than the safety margin left, checkpoint
        // instead of starting work that cannot finish.
        let elapsed = segment_started.elapsed();
        let budget = self.config.segment_timeout();
        let remaining = budget.saturating_sub(elapsed);
        if remaining <= Duration::from_millis(self.config.safety_margin_ms) {
            return self
                .checkpoint_instead_of_executing(&state, step.step_number, trace)
                .await;
        }

        // Commit to this step: the idempotency lock is taken at the moment of
        // commitment so a checkpointed-not-executed step stays claimable.
        let step_lock_key = keys::step_lock(execution_id, step.step_number);
        let claimed = self
            .repository
            .store()
            .set_nx(
                &step_lock_key,
                &Utc::now().to_rfc3339(),
                Some(Duration::from_secs(self.config.step_lock_ttl_s)),
            )
            .await
            .map_err(EngineError::Store)?;
        if !claimed {
            let mut report = SegmentReport::from_state(&state);
            report.duplicate_delivery = true;
            return Ok(report);
        }

        let step_id = step.id;
        let input_snapshot = step.parameters.clone();
        let state = self
            .repository
            .update(execution_id, move |s| {
                s.status = ExecutionStatus::Executing;
                s.segment_number += 1;
                if let Some(step_state) = s.step_state_mut(step_id) {
                    step_state.status = StepStatus::Running;
                    step_state.attempts += 1;
                    step_state.started_at = Some(Utc::now());
                    step_state.input_snapshot = input_snapshot.clone();
                }
                Ok(())
            })
            .await?;

        self.outbox
            .append(
                &SagaEvent::new(EventType::StepStarted, execution_id)
                    .with_step(step.id)
                    .with_segment(state.segment_number)
                    .with_status("running")
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;

        // Tool timeout is the step's own budget bounded by what is left of
        // the segment, minus the safety margin for persistence.
        let elapsed = segment_started.elapsed();
        let remaining = budget
            .saturating_sub(elapsed)
            .saturating_sub(Duration::from_millis(self.config.safety_margin_ms));
        let tool_timeout = Duration::from_millis(step.timeout_ms).min(remaining);

        let (cancel_source, cancel_token) = CancelSource::new();
        let cancel_delay = self
            .config
            .checkpoint_threshold()
            .saturating_sub(segment_started.elapsed());
        let cancel_timer = cancel_source.cancel_after(cancel_delay);

        let outcome = self
            .executor
            .execute(&step.tool_name, step.parameters.clone(), tool_timeout, cancel_token)
            .await;
        cancel_timer.abort();

        if outcome.ok {
            self.on_step_success(state, &step, outcome, segment_started, trace)
                .await
        } else {
            self.on_step_failure(state, &step, outcome, trace).await
        }
    }

    async fn on_step_success(
        &self,
        state: ExecutionState,
        step: &PlanStep,
        outcome: crate::tools::ToolOutcome,
        segment_started: Instant,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        let execution_id = state.execution_id;
        let step_id = step.id;
        let step_number = step.step_number;
        let output = outcome.output.clone();
        let latency_ms = outcome.latency_ms;
        let compensation = outcome.compensation.clone();
        let registered_at = Utc::now();

        let state = self
            .repository
            .update(execution_id, move |s| {
                if let Some(step_state) = s.step_state_mut(step_id) {
                    step_state.status = StepStatus::Completed;
                    step_state.finished_at = Some(Utc::now());
                    step_state.output = output.clone();
                    step_state.latency_ms = Some(latency_ms);
                    step_state.compensation_registered = compensation.is_some();
                }
                if let Some(recipe) = &compensation {
                    // Registered before the next step can start: the record is
                    // part of the same versioned write as the completion.
                    s.compensations.push(CompensationRecord {
                        step_id,
                        step_number,
                        tool_name: recipe.tool_name.clone(),
                        parameters: recipe.parameters.clone(),
                        registered_at,
                        executed_at: None,
                        outcome: None,
                    });
                }
                Ok(())
            })
            .await?;

        self.outbox
            .append(
                &SagaEvent::new(EventType::StepCompleted, execution_id)
                    .with_step(step_id)
                    .with_segment(state.segment_number)
                    .with_status("completed")
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;

        if state.all_steps_finished() {
            let mut report = self.complete_execution(state, trace).await?;
            report.step_executed = Some(step_number);
            report.step_status = SegmentStepStatus::Completed;
            return Ok(report);
        }

        let next_cursor = state
            .next_ready_step()
            .map(|s| s.step_number)
            .unwrap_or(step_number + 1);

        // Budget near exhausted: past the checkpoint threshold, or another
        // step like the one just executed cannot fit in what is left.
        let elapsed = segment_started.elapsed();
        let remaining = self.config.segment_timeout().saturating_sub(elapsed);
        let safety = Duration::from_millis(self.config.safety_margin_ms);
        let budget_spent = elapsed >= self.config.checkpoint_threshold()
            || remaining <= safety + Duration::from_millis(latency_ms);
        if budget_spent {
            self.checkpoints
                .checkpoint_and_continue(
                    execution_id,
                    next_cursor,
                    state.segment_number,
                    CheckpointReason::TimeoutApproaching,
                    trace,
                )
                .await?;
            self.outbox
                .append(
                    &SagaEvent::new(EventType::Checkpointed, execution_id)
                        .with_segment(state.segment_number)
                        .with_message(&format!("cursor={next_cursor}"))
                        .with_trace_id(&trace.trace_id),
                )
                .await
                .map_err(EngineError::Store)?;
        } else {
            self.queue
                .enqueue(ContinuationJob::continuation(
                    execution_id,
                    next_cursor,
                    state.segment_number,
                    trace.child(),
                ))
                .await
                .map_err(EngineError::Queue)?;
        }

        Ok(SegmentReport {
            execution_id,
            step_executed: Some(step_number),
            step_status: SegmentStepStatus::Completed,
            completed_steps: state.completed_steps(),
            total_steps: state.plan.steps.len(),
            is_complete: false,
            next_step_triggered: true,
            status: state.status,
            duplicate_delivery: false,
        })
    }

    async fn on_step_failure(
        &self,
        state: ExecutionState,
        step: &PlanStep,
        outcome: crate::tools::ToolOutcome,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        let execution_id = state.execution_id;
        let step_id = step.id;
        let error = outcome.error.clone().unwrap_or(crate::types::StepError {
            code: "UNKNOWN".into(),
            message: "tool failed without detail".into(),
        });
        let latency_ms = outcome.latency_ms;

        let decision = self.failover.evaluate(&FailoverContext {
            intent_type: state.intent.intent_type,
            error: error.clone(),
            confidence: state.intent.confidence,
            attempt_count: state
                .step_state(step_id)
                .map(|s| s.attempts)
                .unwrap_or(1),
            metadata: step.parameters.clone(),
        });

        let error_for_update = error.clone();
        let recoverable = decision.recoverable;
        let state = self
            .repository
            .update(execution_id, move |s| {
                if let Some(step_state) = s.step_state_mut(step_id) {
                    step_state.status = StepStatus::Failed;
                    step_state.finished_at = Some(Utc::now());
                    step_state.error = Some(error_for_update.clone());
                    step_state.latency_ms = Some(latency_ms);
                }
                if recoverable {
                    s.status = ExecutionStatus::AwaitingResume;
                }
                Ok(())
            })
            .await?;

        self.outbox
            .append(
                &SagaEvent::new(EventType::StepFailed, execution_id)
                    .with_step(step_id)
                    .with_segment(state.segment_number)
                    .with_status("failed")
                    .with_message(&format!("{}: {}", error.code, error.message))
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;

        if decision.recoverable {
            tracing::info!(
                execution_id = %execution_id,
                policy = decision.policy.as_deref().unwrap_or("unmatched"),
                reason = ?decision.reason,
                "recoverable failure, scheduling replan"
            );
            self.outbox
                .append(
                    &SagaEvent::new(EventType::FailoverPolicyTriggered, execution_id)
                        .with_step(step_id)
                        .with_message(
                            decision
                                .policy
                                .as_deref()
                                .unwrap_or("unmatched"),
                        )
                        .with_trace_id(&trace.trace_id),
                )
                .await
                .map_err(EngineError::Store)?;

            self.replanner
                .write_marker(&ReplanMarker {
                    execution_id,
                    failed_step_id: step_id,
                    failed_step_number: step.step_number,
                    decision,
                    created_at: Utc::now(),
                })
                .await?;
            self.queue
                .enqueue(ContinuationJob::replan(
                    execution_id,
                    state.segment_number,
                    trace.child(),
                ))
                .await
                .map_err(EngineError::Queue)?;

            return Ok(SegmentReport {
                execution_id,
                step_executed: Some(step.step_number),
                step_status: SegmentStepStatus::Failed,
                completed_steps: state.completed_steps(),
                total_steps: state.plan.steps.len(),
                is_complete: false,
                next_step_triggered: true,
                status: ExecutionStatus::AwaitingResume,
                duplicate_delivery: false,
            });
        }

        // Terminal failure: unwind what completed, or fail directly when
        // nothing registered a compensation.
        let final_status = if state.compensations.is_empty() {
            self.repository
                .update(execution_id, |s| {
                    s.status = ExecutionStatus::Failed;
                    Ok(())
                })
                .await?;
            self.outbox
                .append(
                    &SagaEvent::new(EventType::ExecutionFailed, execution_id)
                        .with_status("FAILED")
                        .with_message(&format!("{}: {}", error.code, error.message))
                        .with_trace_id(&trace.trace_id),
                )
                .await
                .map_err(EngineError::Store)?;
            ExecutionStatus::Failed
        } else {
            self.compensator.compensate(execution_id, trace).await?;
            ExecutionStatus::Failed
        };
        self.checkpoints.clear(execution_id).await?;

        let state = self.repository.load_required(execution_id).await?;
        Ok(SegmentReport {
            execution_id,
            step_executed: Some(step.step_number),
            step_status: SegmentStepStatus::Failed,
            completed_steps: state.completed_steps(),
            total_steps: state.plan.steps.len(),
            is_complete: false,
            next_step_triggered: false,
            status: final_status,
            duplicate_delivery: false,
        })
    }

    async fn checkpoint_instead_of_executing(
        &self,
        state: &ExecutionState,
        cursor: u32,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        self.checkpoints
            .checkpoint_and_continue(
                state.execution_id,
                cursor,
                state.segment_number,
                CheckpointReason::TimeoutApproaching,
                trace,
            )
            .await?;
        self.outbox
            .append(
                &SagaEvent::new(EventType::Checkpointed, state.execution_id)
                    .with_segment(state.segment_number)
                    .with_message(&format!("cursor={cursor}"))
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;
        Ok(SegmentReport {
            execution_id: state.execution_id,
            step_executed: None,
            step_status: SegmentStepStatus::Pending,
            completed_steps: state.completed_steps(),
            total_steps: state.plan.steps.len(),
            is_complete: false,
            next_step_triggered: true,
            status: state.status,
            duplicate_delivery: false,
        })
    }

    async fn complete_execution(
        &self,
        state: ExecutionState,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        let execution_id = state.execution_id;
        let state = self
            .repository
            .update(execution_id, |s| {
                s.status = ExecutionStatus::Completed;
                s.checkpoint = None;
                Ok(())
            })
            .await?;
        self.checkpoints.clear(execution_id).await?;
        self.outbox
            .append(
                &SagaEvent::new(EventType::ExecutionCompleted, execution_id)
                    .with_segment(state.segment_number)
                    .with_status("COMPLETED")
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;
        tracing::info!(execution_id = %execution_id, "execution completed");
        Ok(SegmentReport::from_state(&state))
    }

    async fn finish_cancelled(
        &self,
        state: ExecutionState,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        let execution_id = state.execution_id;
        let state = if state.status.is_terminal() {
            state
        } else {
            let updated = self
                .repository
                .update(execution_id, |s| {
                    s.status = ExecutionStatus::Cancelled;
                    Ok(())
                })
                .await?;
            self.checkpoints.clear(execution_id).await?;
            self.outbox
                .append(
                    &SagaEvent::new(EventType::ExecutionCancelled, execution_id)
                        .with_status("CANCELLED")
                        .with_trace_id(&trace.trace_id),
                )
                .await
                .map_err(EngineError::Store)?;
            updated
        };
        tracing::info!(execution_id = %execution_id, "execution cancelled, segment exiting");
        Ok(SegmentReport::from_state(&state))
    }
}
