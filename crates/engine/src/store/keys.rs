//! Key schema for the state store
//!
//! One place for every key format so scans, TTLs, and admin tooling agree.

use crate::types::ExecutionId;

/// Prefix shared by all per-execution keys.
pub const EXEC_PREFIX: &str = "exec:";

/// Prefix for DLQ entries.
pub const DLQ_PREFIX: &str = "dlq:saga:";

/// Prefix for outbox entries awaiting drain.
pub const OUTBOX_PREFIX: &str = "outbox:";

/// Durable execution state record.
pub fn execution_state(id: ExecutionId) -> String {
    format!("exec:{id}:state")
}

/// Coarse per-execution lock.
pub fn coarse_lock(id: ExecutionId) -> String {
    format!("exec:{id}:lock")
}

/// Per-step idempotency lock.
pub fn step_lock(id: ExecutionId, step_index: u32) -> String {
    format!("exec:{id}:step:{step_index}:lock")
}

/// Latest checkpoint for an execution.
pub fn checkpoint(id: ExecutionId) -> String {
    format!("exec:{id}:checkpoint")
}

/// Replan marker.
pub fn replan_marker(id: ExecutionId) -> String {
    format!("exec:{id}:replan")
}

/// Dead-letter entry.
pub fn dlq_entry(id: ExecutionId) -> String {
    format!("dlq:saga:{id}")
}

/// Cancellation tombstone.
pub fn tombstone(id: ExecutionId) -> String {
    format!("cancelled:{id}")
}

/// Outbox entry for an event awaiting publication.
pub fn outbox_entry(id: ExecutionId, sequence: u64) -> String {
    format!("outbox:{id}:{sequence:020}")
}

/// Extract the execution id out of an `exec:{id}:state` key.
pub fn execution_id_from_state_key(key: &str) -> Option<ExecutionId> {
    let rest = key.strip_prefix(EXEC_PREFIX)?;
    let id = rest.strip_suffix(":state")?;
    id.parse().ok()
}

/// Extract the execution id out of a `dlq:saga:{id}` key.
pub fn execution_id_from_dlq_key(key: &str) -> Option<ExecutionId> {
    key.strip_prefix(DLQ_PREFIX)?.parse().ok()
}
