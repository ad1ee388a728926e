//! Shared harness for end-to-end engine tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use synapse_engine::{
    CompensationRecipe, Config, ContinuationJob, Intent, IntentType, MemoryJobQueue, Plan,
    PlanConstraints, PlanStep, SynapseRuntime, Tool, ToolFailure, ToolRegistry, ToolResponse,
};

/// Config tuned for tests: in-memory store, no queue signatures.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.store.in_memory = true;
    config.api.require_queue_signature = false;
    config
}

pub struct Harness {
    pub runtime: Arc<SynapseRuntime>,
    pub jobs: tokio::sync::mpsc::UnboundedReceiver<ContinuationJob>,
}

pub fn build_harness(config: Config, registry: Arc<ToolRegistry>) -> Harness {
    let (queue, jobs) = MemoryJobQueue::new();
    let runtime = SynapseRuntime::builder(config)
        .with_queue(queue)
        .with_registry(registry)
        .build()
        .expect("runtime builds");
    Harness { runtime, jobs }
}

impl Harness {
    /// Deliver queued jobs until the queue stays empty.
    pub async fn drive(&mut self) {
        loop {
            match tokio::time::timeout(Duration::from_millis(300), self.jobs.recv()).await {
                Ok(Some(job)) => {
                    self.runtime
                        .handle_job(&job)
                        .await
                        .expect("job handling succeeds");
                }
                _ => break,
            }
        }
    }

    /// Receive the next queued job, if one arrives in time.
    pub async fn next_job(&mut self) -> Option<ContinuationJob> {
        tokio::time::timeout(Duration::from_millis(300), self.jobs.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Build a linear plan where each step depends on its predecessor.
pub fn sequential_plan(intent: &Intent, specs: Vec<(&str, serde_json::Value)>) -> Plan {
    let mut steps = Vec::new();
    let mut previous = None;
    for (index, (tool, params)) in specs.into_iter().enumerate() {
        let mut step = PlanStep::new(index as u32, tool, params);
        if let Some(prev) = previous {
            step = step.with_dependencies(vec![prev]);
        }
        previous = Some(step.id);
        steps.push(step);
    }
    Plan::new(intent.id, steps, PlanConstraints::default(), "test plan").expect("valid plan")
}

pub fn action_intent(text: &str) -> Intent {
    Intent::new(IntentType::Action, text, "test")
}

/// Tool that succeeds after an optional delay, counting invocations.
pub struct RecordingTool {
    name: String,
    pub calls: Arc<AtomicU32>,
    delay: Duration,
    output: serde_json::Value,
    compensation: Option<CompensationRecipe>,
}

impl RecordingTool {
    pub fn new(name: &str, output: serde_json::Value) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                name: name.to_string(),
                calls: Arc::clone(&calls),
                delay: Duration::ZERO,
                output,
                compensation: None,
            }),
            calls,
        )
    }

    pub fn with_delay(name: &str, delay: Duration) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                name: name.to_string(),
                calls: Arc::clone(&calls),
                delay,
                output: serde_json::json!({"done": true}),
                compensation: None,
            }),
            calls,
        )
    }

    pub fn with_compensation(
        name: &str,
        output: serde_json::Value,
        compensation: CompensationRecipe,
    ) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                name: name.to_string(),
                calls: Arc::clone(&calls),
                delay: Duration::ZERO,
                output,
                compensation: Some(compensation),
            }),
            calls,
        )
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _parameters: serde_json::Value) -> Result<ToolResponse, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ToolResponse {
            output: self.output.clone(),
            compensation: self.compensation.clone(),
        })
    }
}

/// Tool that always fails with a logical error.
pub struct FailingTool {
    name: String,
    code: String,
    message: String,
    pub calls: Arc<AtomicU32>,
}

impl FailingTool {
    pub fn new(name: &str, code: &str, message: &str) -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                name: name.to_string(),
                code: code.to_string(),
                message: message.to_string(),
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _parameters: serde_json::Value) -> Result<ToolResponse, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolFailure::logical(&self.code, &self.message))
    }
}

/// Booking tool: full at 19:00, succeeds (with a cancellation recipe) at any
/// other time.
pub struct BookTableTool {
    pub calls: Arc<AtomicU32>,
}

impl BookTableTool {
    pub fn new() -> (Arc<Self>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Arc::new(Self {
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

#[async_trait]
impl Tool for BookTableTool {
    fn name(&self) -> &str {
        "book_restaurant_table"
    }

    async fn invoke(&self, parameters: serde_json::Value) -> Result<ToolResponse, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let time = parameters.get("time").and_then(|v| v.as_str()).unwrap_or("");
        if time == "19:00" {
            return Err(ToolFailure::logical("TOOL_ERROR", "restaurant is full"));
        }
        Ok(ToolResponse {
            output: serde_json::json!({"reservationId": "RES-42", "time": time}),
            compensation: Some(CompensationRecipe {
                tool_name: "cancel_reservation".to_string(),
                parameters: serde_json::json!({"reservationId": "RES-42"}),
            }),
        })
    }
}

/// Compensation target: records the parameters it was invoked with.
pub struct CancelReservationTool {
    pub calls: Arc<AtomicU32>,
    pub last_params: Arc<parking_lot::Mutex<Option<serde_json::Value>>>,
}

impl CancelReservationTool {
    pub fn new() -> (
        Arc<Self>,
        Arc<AtomicU32>,
        Arc<parking_lot::Mutex<Option<serde_json::Value>>>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let last_params = Arc::new(parking_lot::Mutex::new(None));
        (
            Arc::new(Self {
                calls: Arc::clone(&calls),
                last_params: Arc::clone(&last_params),
            }),
            calls,
            last_params,
        )
    }
}

#[async_trait]
impl Tool for CancelReservationTool {
    fn name(&self) -> &str {
        "cancel_reservation"
    }

    async fn invoke(&self, parameters: serde_json::Value) -> Result<ToolResponse, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock() = Some(parameters);
        Ok(ToolResponse {
            output: serde_json::json!({"cancelled": true}),
            compensation: None,
        })
    }
}
