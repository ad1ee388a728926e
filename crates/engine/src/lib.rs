//! Synapse Durable Saga Execution Engine
//!
//! Takes a validated plan and drives it to completion (or compensated
//! failure) across bounded worker invocations: one step per segment,
//! checkpoint/resume through a signed queue, idempotency locks against
//! duplicate deliveries, reverse-order compensation on terminal failure, and
//! policy-driven replanning on recoverable failure.

pub mod api;
pub mod cancel;
pub mod config;
pub mod dlq;
pub mod engine;
pub mod events;
pub mod failover;
pub mod planning;
pub mod queue;
pub mod store;
pub mod tools;
pub mod trace;
pub mod types;

// Re-export commonly used types
pub use cancel::{CancelSource, CancelToken};
pub use config::{Config, EngineConfig, StoreFallbackPolicy};
pub use dlq::{DlqCancelRequest, DlqEntry, DlqMonitor, DlqQuery, DlqResumeRequest, DlqStats};
pub use engine::{
    CheckpointManager, CompensationPolicy, ExecutionRepository, OccConfig, SagaCompensator,
    SegmentReport, SegmentStepStatus, WorkflowMachine,
};
pub use events::{EventBus, EventType, MemoryEventBus, OutboxDrainer, OutboxWriter, SagaEvent};
pub use failover::{
    ActionType, FailoverDecision, FailoverPolicyEngine, Planner, PlanningConstraints, Replanner,
};
pub use planning::{DefaultPlanner, HeuristicIntentParser, IntentParser};
pub use queue::{ContinuationJob, HttpJobQueue, JobKind, JobQueue, MemoryJobQueue};
pub use store::{LockManager, MemoryStateStore, SqliteStateStore, StateStore};
pub use tools::{
    CompensationRecipe, HttpToolServer, RemoteToolServer, Tool, ToolExecutor, ToolFailure,
    ToolOutcome, ToolRegistry, ToolResponse,
};
pub use trace::TraceContext;
pub use types::*;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a chat turn
#[derive(Debug, Clone)]
pub enum ChatOutcome {
    /// A saga-class intent was planned and enqueued
    Execution {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        intent_type: IntentType,
    },
    /// A conversational intent; the reply text goes straight back
    Conversational { intent_type: IntentType, reply: String },
}

/// The assembled engine: every component wired behind its seam.
pub struct SynapseRuntime {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub locks: Arc<LockManager>,
    pub bus: Arc<dyn EventBus>,
    pub outbox: Arc<OutboxWriter>,
    pub drainer: Arc<OutboxDrainer>,
    pub queue: Arc<dyn JobQueue>,
    pub repository: Arc<ExecutionRepository>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<ToolExecutor>,
    pub checkpoints: Arc<CheckpointManager>,
    pub compensation_policy: Arc<CompensationPolicy>,
    pub compensator: Arc<SagaCompensator>,
    pub failover: Arc<FailoverPolicyEngine>,
    pub replanner: Arc<Replanner>,
    pub machine: Arc<WorkflowMachine>,
    pub dlq: Arc<DlqMonitor>,
    pub intent_parser: Arc<dyn IntentParser>,
    pub planner: Arc<dyn Planner>,
    start_time: Instant,
}

/// Builder with per-component overrides; defaults come from [`Config`].
pub struct SynapseRuntimeBuilder {
    config: Config,
    store: Option<Arc<dyn StateStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    bus: Option<Arc<dyn EventBus>>,
    registry: Option<Arc<ToolRegistry>>,
    servers: Vec<Arc<dyn RemoteToolServer>>,
    planner: Option<Arc<dyn Planner>>,
    intent_parser: Option<Arc<dyn IntentParser>>,
    compensation_policy: Option<Arc<CompensationPolicy>>,
    failover: Option<Arc<FailoverPolicyEngine>>,
}

impl SynapseRuntimeBuilder {
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_servers(mut self, servers: Vec<Arc<dyn RemoteToolServer>>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_intent_parser(mut self, parser: Arc<dyn IntentParser>) -> Self {
        self.intent_parser = Some(parser);
        self
    }

    pub fn with_compensation_policy(mut self, policy: Arc<CompensationPolicy>) -> Self {
        self.compensation_policy = Some(policy);
        self
    }

    pub fn with_failover(mut self, failover: Arc<FailoverPolicyEngine>) -> Self {
        self.failover = Some(failover);
        self
    }

    pub fn build(self) -> EngineResult<Arc<SynapseRuntime>> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None if config.store.in_memory => Arc::new(MemoryStateStore::new()),
            None => {
                let path = config
                    .store
                    .path
                    .clone()
                    .unwrap_or_else(config::StoreConfig::default_path);
                Arc::new(SqliteStateStore::open(&path)?)
            }
        };
        let queue: Arc<dyn JobQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(HttpJobQueue::new(config.queue.clone())),
        };
        let bus: Arc<dyn EventBus> = self
            .bus
            .unwrap_or_else(|| Arc::new(MemoryEventBus::default()));
        let registry = self.registry.unwrap_or_else(|| Arc::new(ToolRegistry::new()));
        let planner: Arc<dyn Planner> = self.planner.unwrap_or_else(|| DefaultPlanner::new());
        let intent_parser: Arc<dyn IntentParser> = self
            .intent_parser
            .unwrap_or_else(|| Arc::new(HeuristicIntentParser));
        let compensation_policy = self
            .compensation_policy
            .unwrap_or_else(|| Arc::new(CompensationPolicy::new()));
        let failover = self
            .failover
            .unwrap_or_else(|| Arc::new(FailoverPolicyEngine::with_defaults()));

        let locks = Arc::new(LockManager::new(
            Arc::clone(&store),
            config.store.fallback_policy,
        ));
        let outbox = Arc::new(OutboxWriter::new(Arc::clone(&store)));
        let drainer = Arc::new(OutboxDrainer::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Duration::from_millis(250),
        ));
        let repository = Arc::new(ExecutionRepository::new(
            Arc::clone(&store),
            OccConfig {
                max_retries: config.engine.max_occ_retries,
                base_delay: Duration::from_millis(config.engine.occ_base_delay_ms),
            },
        ));
        let executor = Arc::new(
            ToolExecutor::new(Arc::clone(&registry)).with_servers(self.servers),
        );
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.engine.clone(),
        ));
        let compensator = Arc::new(SagaCompensator::new(
            Arc::clone(&repository),
            Arc::clone(&executor),
            Arc::clone(&outbox),
            Arc::clone(&compensation_policy),
            Duration::from_millis(config.engine.compensation_timeout_ms),
        ));
        let replanner = Arc::new(Replanner::new(
            Arc::clone(&repository),
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&planner),
            Arc::clone(&outbox),
            config.engine.clone(),
        ));
        let machine = Arc::new(WorkflowMachine::new(
            Arc::clone(&repository),
            Arc::clone(&locks),
            Arc::clone(&executor),
            Arc::clone(&checkpoints),
            Arc::clone(&compensator),
            Arc::clone(&failover),
            Arc::clone(&replanner),
            Arc::clone(&queue),
            Arc::clone(&outbox),
            config.engine.clone(),
        ));
        let dlq = Arc::new(DlqMonitor::new(
            Arc::clone(&store),
            Arc::clone(&repository),
            Arc::clone(&checkpoints),
            Arc::clone(&compensator),
            Arc::clone(&queue),
            Arc::clone(&outbox),
            config.dlq.clone(),
        ));

        Ok(Arc::new(SynapseRuntime {
            config,
            store,
            locks,
            bus,
            outbox,
            drainer,
            queue,
            repository,
            registry,
            executor,
            checkpoints,
            compensation_policy,
            compensator,
            failover,
            replanner,
            machine,
            dlq,
            intent_parser,
            planner,
            start_time: Instant::now(),
        }))
    }
}

impl SynapseRuntime {
    pub fn builder(config: Config) -> SynapseRuntimeBuilder {
        SynapseRuntimeBuilder {
            config,
            store: None,
            queue: None,
            bus: None,
            registry: None,
            servers: Vec::new(),
            planner: None,
            intent_parser: None,
            compensation_policy: None,
            failover: None,
        }
    }

    /// Build with defaults from configuration alone.
    pub fn new(config: Config) -> EngineResult<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Persist a fresh execution and enqueue its first segment.
    pub async fn start_execution(
        &self,
        intent: Intent,
        plan: Plan,
        context: HashMap<String, serde_json::Value>,
        trace: &TraceContext,
    ) -> EngineResult<ExecutionId> {
        plan.validate().map_err(EngineError::Plan)?;
        let mut state = ExecutionState::new(intent, plan);
        state.context = context;
        state
            .context
            .insert("trace_id".into(), serde_json::json!(trace.trace_id));
        self.repository.create(&mut state).await?;
        self.queue
            .enqueue(ContinuationJob::continuation(
                state.execution_id,
                0,
                0,
                trace.child(),
            ))
            .await
            .map_err(EngineError::Queue)?;
        tracing::info!(
            execution_id = %state.execution_id,
            steps = state.plan.steps.len(),
            "execution created and first segment enqueued"
        );
        Ok(state.execution_id)
    }

    /// One chat turn: parse, plan (saga-class only), start.
    pub async fn chat(
        &self,
        raw_text: &str,
        context: HashMap<String, serde_json::Value>,
        trace: &TraceContext,
    ) -> EngineResult<ChatOutcome> {
        let intent = self
            .intent_parser
            .parse(raw_text)
            .await
            .map_err(EngineError::Internal)?;
        if !intent.intent_type.is_saga_class() {
            return Ok(ChatOutcome::Conversational {
                intent_type: intent.intent_type,
                reply: format!("({}) {}", intent.intent_type, raw_text),
            });
        }
        let constraints = PlanningConstraints {
            base: PlanConstraints::default(),
            suggestions: Vec::new(),
            previous_plan: None,
        };
        let plan = self
            .planner
            .plan(&intent, &constraints)
            .await
            .map_err(EngineError::Internal)?;
        let intent_type = intent.intent_type;
        let execution_id = self.start_execution(intent, plan, context, trace).await?;
        Ok(ChatOutcome::Execution {
            execution_id,
            status: ExecutionStatus::Planned,
            intent_type,
        })
    }

    /// Dispatch one delivered queue job.
    pub async fn handle_job(&self, job: &ContinuationJob) -> EngineResult<Option<SegmentReport>> {
        let trace = job.trace_context();
        match job.kind {
            JobKind::Continuation => {
                let report = self
                    .machine
                    .execute_segment(job.execution_id, job.start_step_index, &trace)
                    .await?;
                Ok(Some(report))
            }
            JobKind::Replan => {
                self.replanner.replan(job.execution_id, &trace).await?;
                Ok(None)
            }
        }
    }

    /// Resume from the latest checkpoint. A resume against a terminated
    /// execution is a no-op reporting the terminal status.
    pub async fn resume_from_checkpoint(
        &self,
        execution_id: ExecutionId,
        trace: &TraceContext,
    ) -> EngineResult<SegmentReport> {
        let state = self.repository.load_required(execution_id).await?;
        if state.status.is_terminal() {
            return Ok(SegmentReport {
                execution_id,
                step_executed: None,
                step_status: SegmentStepStatus::NoStepsRemaining,
                completed_steps: state.completed_steps(),
                total_steps: state.plan.steps.len(),
                is_complete: state.status == ExecutionStatus::Completed,
                next_step_triggered: false,
                status: state.status,
                duplicate_delivery: false,
            });
        }
        let cursor = match self.checkpoints.load(execution_id).await? {
            Some(checkpoint) => Some(checkpoint.cursor),
            None => state.next_ready_step().map(|s| s.step_number),
        };
        self.machine
            .execute_segment(execution_id, cursor, trace)
            .await
    }

    /// Cancel an execution: tombstone plus event. The next segment worker
    /// observes the tombstone and exits without executing further steps.
    pub async fn cancel_execution(
        &self,
        execution_id: ExecutionId,
        reason: &str,
        trace: &TraceContext,
    ) -> EngineResult<()> {
        // Verify the execution exists before tombstoning.
        let _ = self.repository.load_required(execution_id).await?;
        self.store
            .put(
                &store::keys::tombstone(execution_id),
                &Utc::now().to_rfc3339(),
                Some(Duration::from_secs(self.config.engine.tombstone_ttl_s)),
            )
            .await
            .map_err(EngineError::Store)?;
        self.outbox
            .append(
                &SagaEvent::new(EventType::ExecutionCancelled, execution_id)
                    .with_message(reason)
                    .with_trace_id(&trace.trace_id),
            )
            .await
            .map_err(EngineError::Store)?;
        Ok(())
    }

    /// Read an execution record.
    pub async fn get_execution(&self, execution_id: ExecutionId) -> EngineResult<ExecutionState> {
        self.repository.load_required(execution_id).await
    }

    /// Spawn the background tasks (outbox drainer, DLQ monitor).
    pub fn spawn_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self.drainer).run()),
            tokio::spawn(Arc::clone(&self.dlq).run()),
        ]
    }

    /// Drive jobs from an in-process queue receiver. Used by `synapse up`
    /// single-node mode and by tests.
    pub async fn run_worker(
        self: Arc<Self>,
        mut receiver: tokio::sync::mpsc::UnboundedReceiver<ContinuationJob>,
    ) {
        while let Some(job) = receiver.recv().await {
            if let Err(e) = self.handle_job(&job).await {
                tracing::warn!(
                    execution_id = %job.execution_id,
                    error = %e,
                    "job handling failed, awaiting queue redelivery"
                );
            }
        }
    }
}
