//! Dead-letter queue monitor and admin operations
//!
//! Periodically scans for zombie executions (in-flight status, no activity
//! past the stall threshold), attempts automatic recovery by resuming from
//! the checkpoint, and parks exhausted executions in the DLQ namespace for
//! operator review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DlqConfig;
use crate::engine::checkpoint::CheckpointManager;
use crate::engine::compensation::SagaCompensator;
use crate::engine::repository::ExecutionRepository;
use crate::events::{EventType, OutboxWriter, SagaEvent};
use crate::queue::{ContinuationJob, JobQueue};
use crate::store::{keys, StateStore};
use crate::trace::TraceContext;
use crate::types::{
    DlqError, EngineError, EngineResult, ExecutionId, ExecutionStatus, StepId, StepStatus,
    StoreError,
};

/// A parked execution awaiting operator attention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub execution_id: ExecutionId,
    pub status_at_parking: ExecutionStatus,
    pub requires_human_intervention: bool,
    pub failed_step_ids: Vec<StepId>,
    pub recovery_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub inactive_duration_s: u64,
    pub last_activity_at: DateTime<Utc>,
    pub parked_at: DateTime<Utc>,
}

/// Query parameters for listing DLQ entries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DlqQuery {
    pub status: Option<ExecutionStatus>,
    pub min_inactive_minutes: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub sort_by: Option<DlqSortField>,
    pub sort_order: Option<SortOrder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqSortField {
    ParkedAt,
    InactiveDuration,
    RecoveryAttempts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Aggregate statistics over the DLQ namespace
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub total: usize,
    pub requiring_human: usize,
    pub auto_recoverable: usize,
    pub oldest_parked_at: Option<DateTime<Utc>>,
    pub mean_inactive_duration_s: u64,
}

/// Admin request to resume a parked execution
#[derive(Debug, Clone, Deserialize)]
pub struct DlqResumeRequest {
    pub fixed_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    pub skip_steps: Option<Vec<u32>>,
    pub resume_from_step: Option<u32>,
    pub reason: String,
    pub admin_user_id: String,
}

/// Admin request to cancel a parked execution
#[derive(Debug, Clone, Deserialize)]
pub struct DlqCancelRequest {
    pub reason: String,
    pub admin_user_id: String,
    pub attempt_compensation: bool,
}

pub struct DlqMonitor {
    store: Arc<dyn StateStore>,
    repository: Arc<ExecutionRepository>,
    checkpoints: Arc<CheckpointManager>,
    compensator: Arc<SagaCompensator>,
    queue: Arc<dyn JobQueue>,
    outbox: Arc<OutboxWriter>,
    config: DlqConfig,
}

impl DlqMonitor {
    pub fn new(
        store: Arc<dyn StateStore>,
        repository: Arc<ExecutionRepository>,
        checkpoints: Arc<CheckpointManager>,
        compensator: Arc<SagaCompensator>,
        queue: Arc<dyn JobQueue>,
        outbox: Arc<OutboxWriter>,
        config: DlqConfig,
    ) -> Self {
        Self {
            store,
            repository,
            checkpoints,
            compensator,
            queue,
            outbox,
            config,
        }
    }

    /// One scan pass. Returns the ids of executions acted upon.
    pub async fn scan_once(&self) -> EngineResult<Vec<ExecutionId>> {
        let entries = self
            .store
            .scan_prefix(keys::EXEC_PREFIX)
            .await
            .map_err(EngineError::Store)?;
        let now = Utc::now();
        let mut touched = Vec::new();

        for (key, value) in entries {
            let Some(execution_id) = keys::execution_id_from_state_key(&key) else {
                continue;
            };
            let Ok(state) = serde_json::from_str::<crate::types::ExecutionState>(&value) else {
                tracing::warn!(key = %key, "unreadable execution record during DLQ scan");
                continue;
            };
            if !matches!(
                state.status,
                ExecutionStatus::Executing
                    | ExecutionStatus::AwaitingResume
                    | ExecutionStatus::Compensating
            ) {
                continue;
            }
            let inactive = now.signed_duration_since(state.last_activity_at);
            if inactive.num_seconds() < self.config.stall_threshold_s as i64 {
                continue;
            }
            // Already parked: leave it for the operator.
            if self
                .store
                .get(&keys::dlq_entry(execution_id))
                .await
                .map_err(EngineError::Store)?
                .is_some()
            {
                continue;
            }

            self.handle_zombie(&state, inactive.num_seconds() as u64)
                .await?;
            touched.push(execution_id);
        }
        Ok(touched)
    }

    async fn handle_zombie(
        &self,
        state: &crate::types::ExecutionState,
        inactive_duration_s: u64,
    ) -> EngineResult<()> {
        let execution_id = state.execution_id;
        let attempts_key = format!("exec:{execution_id}:recovery");
        let attempts: u32 = self
            .store
            .get(&attempts_key)
            .await
            .map_err(EngineError::Store)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if attempts < self.config.max_recovery_attempts {
            let cursor = match self.checkpoints.load(execution_id).await? {
                Some(checkpoint) => checkpoint.cursor,
                None => state
                    .next_ready_step()
                    .map(|s| s.step_number)
                    .unwrap_or(0),
            };
            tracing::info!(
                execution_id = %execution_id,
                attempt = attempts + 1,
                cursor,
                "zombie execution, attempting automatic recovery"
            );
            self.store
                .put(
                    &attempts_key,
                    &(attempts + 1).to_string(),
                    Some(Duration::from_secs(self.config.entry_ttl_s)),
                )
                .await
                .map_err(EngineError::Store)?;
            self.queue
                .enqueue(ContinuationJob::continuation(
                    execution_id,
                    cursor,
                    state.segment_number,
                    TraceContext::new(),
                ))
                .await
                .map_err(EngineError::Queue)?;
            return Ok(());
        }

        // Recovery exhausted: park in the DLQ namespace.
        let failed_step_ids = state
            .step_states
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_id)
            .collect::<Vec<_>>();
        let failure_reason = state
            .step_states
            .iter()
            .filter_map(|s| s.error.as_ref())
            .map(|e| format!("{}: {}", e.code, e.message))
            .next();
        let entry = DlqEntry {
            execution_id,
            status_at_parking: state.status,
            requires_human_intervention: true,
            failed_step_ids,
            recovery_attempts: attempts,
            failure_reason,
            inactive_duration_s,
            last_activity_at: state.last_activity_at,
            parked_at: Utc::now(),
        };
        let value = serde_json::to_string(&entry)
            .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
        self.store
            .put(
                &keys::dlq_entry(execution_id),
                &value,
                Some(Duration::from_secs(self.config.entry_ttl_s)),
            )
            .await
            .map_err(EngineError::Store)?;
        tracing::warn!(
            execution_id = %execution_id,
            recovery_attempts = attempts,
            "execution parked in DLQ after exhausting automatic recovery"
        );
        Ok(())
    }

    /// Run the scan loop until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.scan_interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.scan_once().await {
                Ok(touched) if !touched.is_empty() => {
                    tracing::info!(count = touched.len(), "DLQ scan acted on zombie executions");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "DLQ scan failed"),
            }
        }
    }

    /// List parked entries with filtering, sorting, and pagination.
    pub async fn list(&self, query: &DlqQuery) -> EngineResult<Vec<DlqEntry>> {
        let raw = self
            .store
            .scan_prefix(keys::DLQ_PREFIX)
            .await
            .map_err(EngineError::Store)?;
        let mut entries: Vec<DlqEntry> = raw
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_str(&value).ok())
            .collect();

        if let Some(status) = query.status {
            entries.retain(|e| e.status_at_parking == status);
        }
        if let Some(min_minutes) = query.min_inactive_minutes {
            entries.retain(|e| e.inactive_duration_s >= min_minutes * 60);
        }

        let sort_by = query.sort_by.unwrap_or(DlqSortField::ParkedAt);
        entries.sort_by(|a, b| {
            let ordering = match sort_by {
                DlqSortField::ParkedAt => a.parked_at.cmp(&b.parked_at),
                DlqSortField::InactiveDuration => {
                    a.inactive_duration_s.cmp(&b.inactive_duration_s)
                }
                DlqSortField::RecoveryAttempts => a.recovery_attempts.cmp(&b.recovery_attempts),
            };
            match query.sort_order.unwrap_or(SortOrder::Desc) {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(50);
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    /// Aggregate statistics for dashboards.
    pub async fn stats(&self) -> EngineResult<DlqStats> {
        let entries = self.list(&DlqQuery { limit: Some(usize::MAX), ..Default::default() }).await?;
        let total = entries.len();
        let requiring_human = entries.iter().filter(|e| e.requires_human_intervention).count();
        let mean = if total > 0 {
            entries.iter().map(|e| e.inactive_duration_s).sum::<u64>() / total as u64
        } else {
            0
        };
        Ok(DlqStats {
            total,
            requiring_human,
            auto_recoverable: total - requiring_human,
            oldest_parked_at: entries.iter().map(|e| e.parked_at).min(),
            mean_inactive_duration_s: mean,
        })
    }

    /// Fetch one parked entry.
    pub async fn get(&self, execution_id: ExecutionId) -> EngineResult<DlqEntry> {
        match self
            .store
            .get(&keys::dlq_entry(execution_id))
            .await
            .map_err(EngineError::Store)?
        {
            Some(value) => serde_json::from_str(&value)
                .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string()))),
            None => Err(EngineError::Dlq(DlqError::EntryNotFound { execution_id })),
        }
    }

    /// Operator resume: optionally patch parameters, skip steps, and pick the
    /// resume point, then re-enqueue.
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
        request: &DlqResumeRequest,
    ) -> EngineResult<()> {
        if request.reason.trim().len() < 10 {
            return Err(EngineError::Dlq(DlqError::ResumeRejected {
                reason: "resume reason must be at least 10 characters".into(),
            }));
        }
        // Entry must exist; resuming a live execution is the mesh endpoint's job.
        let _entry = self.get(execution_id).await?;

        let fixed = request.fixed_parameters.clone();
        let skip = request.skip_steps.clone().unwrap_or_default();
        let resume_from = request.resume_from_step;
        let reason = request.reason.clone();
        let admin = request.admin_user_id.clone();
        let store = Arc::clone(&self.store);

        let state = self
            .repository
            .update(execution_id, move |s| {
                let step_index: Vec<(crate::types::StepId, u32)> = s
                    .plan
                    .steps
                    .iter()
                    .map(|st| (st.id, st.step_number))
                    .collect();
                for (step_id, number) in step_index {
                    let Some(step_state) = s
                        .step_states
                        .iter_mut()
                        .find(|st| st.step_id == step_id)
                    else {
                        continue;
                    };
                    if skip.contains(&number) && step_state.status != StepStatus::Completed {
                        step_state.status = StepStatus::Skipped;
                        continue;
                    }
                    if let Some(from) = resume_from {
                        if number < from && step_state.status != StepStatus::Completed {
                            step_state.status = StepStatus::Skipped;
                            continue;
                        }
                    }
                    // Failed or wedged-running steps become runnable again.
                    if matches!(step_state.status, StepStatus::Failed | StepStatus::Running) {
                        step_state.status = StepStatus::Pending;
                        step_state.error = None;
                    }
                }
                if let Some(fixed) = &fixed {
                    // Patch parameters on every step that declares the field.
                    for step in &mut s.plan.steps {
                        if let serde_json::Value::Object(params) = &mut step.parameters {
                            for (key, value) in fixed {
                                if params.contains_key(key) {
                                    params.insert(key.clone(), value.clone());
                                }
                            }
                        }
                    }
                }
                s.status = ExecutionStatus::Executing;
                s.context.insert(
                    "dlq_resume".to_string(),
                    serde_json::json!({ "reason": reason, "admin_user_id": admin }),
                );
                Ok(())
            })
            .await?;

        // Clear locks for steps made runnable again so redelivery executes them.
        for step in &state.plan.steps {
            let step_state = state.step_state(step.id);
            if step_state.map(|s| s.status == StepStatus::Pending).unwrap_or(false) {
                let _ = store
                    .delete(&keys::step_lock(execution_id, step.step_number))
                    .await;
            }
        }
        let _ = store.delete(&format!("exec:{execution_id}:recovery")).await;
        self.store
            .delete(&keys::dlq_entry(execution_id))
            .await
            .map_err(EngineError::Store)?;

        let cursor = state.next_ready_step().map(|s| s.step_number).unwrap_or(0);
        self.queue
            .enqueue(ContinuationJob::continuation(
                execution_id,
                cursor,
                state.segment_number,
                TraceContext::new(),
            ))
            .await
            .map_err(EngineError::Queue)?;
        tracing::info!(
            execution_id = %execution_id,
            admin_user = %request.admin_user_id,
            cursor,
            "execution resumed from DLQ"
        );
        Ok(())
    }

    /// Operator cancel: tombstone, optional compensation, entry removal.
    pub async fn cancel(
        &self,
        execution_id: ExecutionId,
        request: &DlqCancelRequest,
    ) -> EngineResult<()> {
        if request.reason.trim().is_empty() {
            return Err(EngineError::Dlq(DlqError::CancelRejected {
                reason: "cancel reason must not be empty".into(),
            }));
        }
        let _entry = self.get(execution_id).await?;
        let state = self.repository.load_required(execution_id).await?;

        self.store
            .put(
                &keys::tombstone(execution_id),
                &Utc::now().to_rfc3339(),
                Some(Duration::from_secs(self.config.entry_ttl_s)),
            )
            .await
            .map_err(EngineError::Store)?;

        let trace = TraceContext::new();
        if request.attempt_compensation && !state.compensations.is_empty() {
            self.compensator.compensate(execution_id, &trace).await?;
        } else {
            let reason = request.reason.clone();
            let admin = request.admin_user_id.clone();
            self.repository
                .update(execution_id, move |s| {
                    s.status = ExecutionStatus::Cancelled;
                    s.context.insert(
                        "dlq_cancel".to_string(),
                        serde_json::json!({ "reason": reason, "admin_user_id": admin }),
                    );
                    Ok(())
                })
                .await?;
        }
        self.checkpoints.clear(execution_id).await?;
        self.store
            .delete(&keys::dlq_entry(execution_id))
            .await
            .map_err(EngineError::Store)?;
        self.outbox
            .append(
                &SagaEvent::new(EventType::ExecutionCancelled, execution_id)
                    .with_status("CANCELLED")
                    .with_message(&request.reason)
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;
        tracing::info!(
            execution_id = %execution_id,
            admin_user = %request.admin_user_id,
            "execution cancelled from DLQ"
        );
        Ok(())
    }
}
