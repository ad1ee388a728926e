//! The durable saga execution core
//!
//! One segment = one bounded worker invocation executing at most one step of
//! one execution. The machine, checkpoint manager, compensator, and OCC
//! repository cooperate through the state store; the queue chains segments.

pub mod checkpoint;
pub mod compensation;
pub mod machine;
pub mod occ;
pub mod repository;

pub use checkpoint::CheckpointManager;
pub use compensation::{CompensationPolicy, CompensationSummary, SagaCompensator};
pub use machine::{SegmentReport, SegmentStepStatus, WorkflowMachine};
pub use occ::OccConfig;
pub use repository::ExecutionRepository;
