//! Error types and the failure taxonomy for the saga execution engine

use thiserror::Error;

use super::{ExecutionId, StepId};

/// Main engine error type
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolExecutorError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Replan error: {0}")]
    Replan(#[from] ReplanError),

    #[error("DLQ error: {0}")]
    Dlq(#[from] DlqError),

    #[error("Execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: ExecutionId },

    #[error("Execution {execution_id} is in terminal status {status}")]
    ExecutionTerminal {
        execution_id: ExecutionId,
        status: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Environment variable error: {message}")]
    EnvError { message: String },
}

/// State store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Sqlite error: {0}")]
    Sqlite(String),

    #[error("Key not found: {0}")]
    NotFound(String),
}

/// Locking and idempotency errors
#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("Lock already held: {key}")]
    Held { key: String },

    #[error("Lock backend unavailable: {reason}")]
    BackendUnavailable { reason: String },
}

/// Queue delivery errors
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Enqueue failed after {attempts} attempts: {reason}")]
    EnqueueFailed { attempts: u32, reason: String },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Signature verification failed: {0}")]
    SignatureInvalid(String),
}

/// Tool executor errors (technical layer; logical failures travel in `ToolOutcome`)
#[derive(Error, Debug, Clone)]
pub enum ToolExecutorError {
    #[error("Tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    #[error("Tool invocation timed out: {tool_name}")]
    Timeout { tool_name: String },

    #[error("Tool invocation cancelled: {tool_name}")]
    Cancelled { tool_name: String },

    #[error("Transport failure calling {tool_name}: {reason}")]
    Transport { tool_name: String, reason: String },
}

/// Plan validation errors, rejected at ingestion
#[derive(Error, Debug, Clone)]
pub enum PlanError {
    #[error("Plan exceeds maximum step count: {count} > {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("Dependency cycle detected involving step {step_id}")]
    DependencyCycle { step_id: StepId },

    #[error("Step {step_id} depends on unknown step {dependency}")]
    UnknownDependency { step_id: StepId, dependency: StepId },

    #[error("Step {step_id} depends on a later step {dependency}")]
    ForwardDependency { step_id: StepId, dependency: StepId },

    #[error("Duplicate step number {step_number}")]
    DuplicateStepNumber { step_number: u32 },

    #[error("Tool {tool_name} is not in the allowed set")]
    ToolNotAllowed { tool_name: String },

    #[error("Invalid step timeout: {0} ms")]
    InvalidTimeout(u64),
}

/// Replanning errors
#[derive(Error, Debug, Clone)]
pub enum ReplanError {
    #[error("No replan marker for execution {execution_id}")]
    MarkerMissing { execution_id: ExecutionId },

    #[error("Planner failed: {0}")]
    PlannerFailed(String),

    #[error("Replanned plan rejected: {0}")]
    PlanRejected(#[from] PlanError),
}

/// DLQ administration errors
#[derive(Error, Debug, Clone)]
pub enum DlqError {
    #[error("No DLQ entry for execution {execution_id}")]
    EntryNotFound { execution_id: ExecutionId },

    #[error("Resume rejected: {reason}")]
    ResumeRejected { reason: String },

    #[error("Cancel rejected: {reason}")]
    CancelRejected { reason: String },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
