//! Tool executor: the uniform façade over local and remote tools
//!
//! Resolution order is remote-first (the first server advertising the name
//! wins), then the local registry. Technical failures are retried here with
//! exponential backoff; logical failures bubble to the workflow machine
//! untouched. Every invocation races its timeout against the caller's
//! cancel token, and declared response schemas are enforced on the way out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::types::StepError;

pub mod registry;
pub mod remote;

pub use registry::{CompensationRecipe, Tool, ToolFailure, ToolRegistry, ToolResponse};
pub use remote::{HttpToolServer, RemoteToolDescriptor, RemoteToolServer};

/// Error code for unknown tools.
pub const ERR_TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
/// Error code for invocations that exceeded their budget.
pub const ERR_TIMEOUT: &str = "TIMEOUT";
/// Error code for cooperative cancellation.
pub const ERR_CANCELLED: &str = "CANCELLED";
/// Error code for schema-invalid tool output.
pub const ERR_SCHEMA: &str = "LOGICAL_ERROR(schema)";

/// Result of one tool execution. Mirrors the wire contract: failures are
/// data, not exceptions.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub ok: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<StepError>,
    pub compensation: Option<CompensationRecipe>,
    pub latency_ms: u64,
}

impl ToolOutcome {
    fn success(
        output: serde_json::Value,
        compensation: Option<CompensationRecipe>,
        latency_ms: u64,
    ) -> Self {
        Self {
            ok: true,
            output: Some(output),
            error: None,
            compensation,
            latency_ms,
        }
    }

    fn failure(code: &str, message: &str, latency_ms: u64) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(StepError {
                code: code.to_string(),
                message: message.to_string(),
            }),
            compensation: None,
            latency_ms,
        }
    }
}

/// Technical-error retry configuration
#[derive(Debug, Clone)]
pub struct ToolRetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for ToolRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

/// Uniform façade over local tools and remote tool servers.
pub struct ToolExecutor {
    servers: Vec<Arc<dyn RemoteToolServer>>,
    registry: Arc<ToolRegistry>,
    retry: ToolRetryConfig,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            servers: Vec::new(),
            registry,
            retry: ToolRetryConfig::default(),
        }
    }

    pub fn with_servers(mut self, servers: Vec<Arc<dyn RemoteToolServer>>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_retry(mut self, retry: ToolRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Execute a tool by name. The whole call (including technical retries)
    /// is bounded by `timeout` and aborts early when `cancel` fires.
    pub async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
        timeout: Duration,
        cancel: CancelToken,
    ) -> ToolOutcome {
        let started = Instant::now();

        let resolved = self.resolve(tool_name);
        let (invoke_target, schema) = match resolved {
            Some(target) => target,
            None => {
                return ToolOutcome::failure(
                    ERR_TOOL_NOT_FOUND,
                    &format!("no server or local registration for '{tool_name}'"),
                    elapsed_ms(started),
                );
            }
        };

        let attempt_loop = self.invoke_with_retries(&invoke_target, tool_name, parameters, timeout);
        let result = tokio::select! {
            result = attempt_loop => result,
            _ = tokio::time::sleep(timeout) => {
                return ToolOutcome::failure(
                    ERR_TIMEOUT,
                    &format!("tool '{tool_name}' exceeded {} ms", timeout.as_millis()),
                    elapsed_ms(started),
                );
            }
            _ = cancel.cancelled() => {
                return ToolOutcome::failure(
                    ERR_CANCELLED,
                    &format!("tool '{tool_name}' cancelled by segment budget"),
                    elapsed_ms(started),
                );
            }
        };

        let latency_ms = elapsed_ms(started);
        match result {
            Ok(response) => {
                if let Some(schema) = schema {
                    if let Err(message) = validate_against_schema(&schema, &response.output) {
                        return ToolOutcome::failure(ERR_SCHEMA, &message, latency_ms);
                    }
                }
                ToolOutcome::success(response.output, response.compensation, latency_ms)
            }
            Err(ToolFailure::Logical { code, message }) => {
                ToolOutcome::failure(&code, &message, latency_ms)
            }
            Err(ToolFailure::Technical { reason }) => ToolOutcome::failure(
                "TECHNICAL_ERROR",
                &format!("retries exhausted: {reason}"),
                latency_ms,
            ),
        }
    }

    fn resolve(&self, tool_name: &str) -> Option<(InvokeTarget, Option<serde_json::Value>)> {
        for server in &self.servers {
            if server.advertises(tool_name) {
                let schema = server
                    .descriptor(tool_name)
                    .and_then(|d| d.response_schema);
                return Some((InvokeTarget::Remote(Arc::clone(server)), schema));
            }
        }
        self.registry.get(tool_name).map(|tool| {
            let schema = tool.response_schema().cloned();
            (InvokeTarget::Local(tool), schema)
        })
    }

    async fn invoke_with_retries(
        &self,
        target: &InvokeTarget,
        tool_name: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolResponse, ToolFailure> {
        let mut last_failure = ToolFailure::technical("no attempts made");
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let backoff = self.retry.base_backoff * 2u32.pow(attempt - 1);
                tracing::debug!(tool_name, attempt, backoff_ms = backoff.as_millis() as u64,
                    "retrying after technical failure");
                tokio::time::sleep(backoff).await;
            }
            let result = match target {
                InvokeTarget::Remote(server) => {
                    server.execute(tool_name, parameters.clone(), timeout).await
                }
                InvokeTarget::Local(tool) => tool.invoke(parameters.clone()).await,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(failure @ ToolFailure::Logical { .. }) => return Err(failure),
                Err(failure @ ToolFailure::Technical { .. }) => {
                    last_failure = failure;
                }
            }
        }
        Err(last_failure)
    }
}

enum InvokeTarget {
    Remote(Arc<dyn RemoteToolServer>),
    Local(Arc<dyn Tool>),
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn validate_against_schema(
    schema: &serde_json::Value,
    output: &serde_json::Value,
) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("invalid response schema: {e}"))?;
    let mut errors = validator.iter_errors(output).peekable();
    if errors.peek().is_some() {
        let detail: Vec<String> = errors.map(|e| e.to_string()).take(3).collect();
        return Err(format!("output failed schema validation: {}", detail.join("; ")));
    }
    Ok(())
}
