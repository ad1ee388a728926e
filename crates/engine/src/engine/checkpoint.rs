//! Checkpoint manager: segment boundaries and continuation chaining
//!
//! A checkpoint is always written before the continuation job is enqueued,
//! so a queue retry arriving after the worker died finds a consistent
//! cursor. Checkpoints are overwritten at each boundary and deleted when the
//! execution reaches a terminal status.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::queue::{ContinuationJob, JobQueue};
use crate::store::{keys, StateStore};
use crate::trace::TraceContext;
use crate::types::{
    Checkpoint, CheckpointReason, EngineError, EngineResult, ExecutionId, StoreError,
};

pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn JobQueue>,
    config: EngineConfig,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn JobQueue>, config: EngineConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Write the checkpoint record. Overwrites any previous checkpoint.
    pub async fn create(
        &self,
        execution_id: ExecutionId,
        cursor: u32,
        segment_number: u32,
        reason: CheckpointReason,
        trace: &TraceContext,
    ) -> EngineResult<Checkpoint> {
        let checkpoint = Checkpoint {
            execution_id,
            cursor,
            segment_number,
            reason,
            trace_id: Some(trace.trace_id.clone()),
            created_at: Utc::now(),
        };
        let value = serde_json::to_string(&checkpoint)
            .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
        self.store
            .put(
                &keys::checkpoint(execution_id),
                &value,
                Some(Duration::from_secs(self.config.checkpoint_ttl_s)),
            )
            .await
            .map_err(EngineError::Store)?;
        Ok(checkpoint)
    }

    /// Checkpoint, then enqueue the continuation. Strictly in that order.
    pub async fn checkpoint_and_continue(
        &self,
        execution_id: ExecutionId,
        cursor: u32,
        segment_number: u32,
        reason: CheckpointReason,
        trace: &TraceContext,
    ) -> EngineResult<Checkpoint> {
        let checkpoint = self
            .create(execution_id, cursor, segment_number, reason, trace)
            .await?;
        self.queue
            .enqueue(ContinuationJob::continuation(
                execution_id,
                cursor,
                segment_number,
                trace.child(),
            ))
            .await
            .map_err(EngineError::Queue)?;
        Ok(checkpoint)
    }

    /// Load the latest checkpoint, if any.
    pub async fn load(&self, execution_id: ExecutionId) -> EngineResult<Option<Checkpoint>> {
        match self
            .store
            .get(&keys::checkpoint(execution_id))
            .await
            .map_err(EngineError::Store)?
        {
            Some(value) => {
                let checkpoint = serde_json::from_str(&value)
                    .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    /// Delete the checkpoint (terminal statuses).
    pub async fn clear(&self, execution_id: ExecutionId) -> EngineResult<()> {
        self.store
            .delete(&keys::checkpoint(execution_id))
            .await
            .map_err(EngineError::Store)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryJobQueue;
    use crate::store::MemoryStateStore;

    fn manager() -> (
        CheckpointManager,
        tokio::sync::mpsc::UnboundedReceiver<ContinuationJob>,
    ) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let (queue, rx) = MemoryJobQueue::new();
        (
            CheckpointManager::new(store, queue, EngineConfig::default()),
            rx,
        )
    }

    #[tokio::test]
    async fn test_checkpoint_written_before_enqueue() {
        let (manager, mut rx) = manager();
        let execution_id = ExecutionId::new();
        let trace = TraceContext::new();
        manager
            .checkpoint_and_continue(execution_id, 2, 3, CheckpointReason::TimeoutApproaching, &trace)
            .await
            .unwrap();

        // By the time the job is observable the checkpoint must exist.
        let job = rx.recv().await.unwrap();
        assert_eq!(job.start_step_index, Some(2));
        let loaded = manager.load(execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 2);
        assert_eq!(loaded.segment_number, 3);
        assert_eq!(loaded.reason, CheckpointReason::TimeoutApproaching);
    }

    #[tokio::test]
    async fn test_checkpoint_overwritten_and_cleared() {
        let (manager, _rx) = manager();
        let execution_id = ExecutionId::new();
        let trace = TraceContext::new();
        manager
            .create(execution_id, 1, 1, CheckpointReason::TimeoutApproaching, &trace)
            .await
            .unwrap();
        manager
            .create(execution_id, 2, 2, CheckpointReason::TimeoutApproaching, &trace)
            .await
            .unwrap();
        assert_eq!(manager.load(execution_id).await.unwrap().unwrap().cursor, 2);
        manager.clear(execution_id).await.unwrap();
        assert!(manager.load(execution_id).await.unwrap().is_none());
    }
}
