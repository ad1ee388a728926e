//! Load/store of execution state with versioned writes
//!
//! All multi-field mutations flow through [`ExecutionRepository::update`],
//! which re-reads and re-applies the caller's delta on version conflict. The
//! in-record `version` mirrors the store-side version after every write, so
//! it strictly increases across successful writes.

use std::sync::Arc;

use super::occ::OccConfig;
use crate::store::{keys, StateStore};
use crate::types::{EngineError, EngineResult, ExecutionId, ExecutionState, StoreError};

pub struct ExecutionRepository {
    store: Arc<dyn StateStore>,
    occ: OccConfig,
}

impl ExecutionRepository {
    pub fn new(store: Arc<dyn StateStore>, occ: OccConfig) -> Self {
        Self { store, occ }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Persist a brand-new execution record. Fails if the id already exists.
    pub async fn create(&self, state: &mut ExecutionState) -> EngineResult<()> {
        let key = keys::execution_state(state.execution_id);
        // Stamp the version the store will assign so the stored record and
        // the store-side counter agree from the first write.
        state.version = 1;
        let value = serde_json::to_string(state)
            .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
        let version = self
            .store
            .put_versioned(&key, &value, None, None)
            .await
            .map_err(EngineError::Store)?;
        state.version = version;
        Ok(())
    }

    async fn persist(&self, state: &mut ExecutionState, expected: u64) -> EngineResult<()> {
        let key = keys::execution_state(state.execution_id);
        state.version = expected + 1;
        let value = serde_json::to_string(state)
            .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
        let version = self
            .store
            .put_versioned(&key, &value, Some(expected), None)
            .await
            .map_err(EngineError::Store)?;
        state.version = version;
        Ok(())
    }

    /// Load an execution record, if present.
    pub async fn load(&self, execution_id: ExecutionId) -> EngineResult<Option<ExecutionState>> {
        let key = keys::execution_state(execution_id);
        match self.store.get_versioned(&key).await.map_err(EngineError::Store)? {
            Some(versioned) => {
                let mut state: ExecutionState = serde_json::from_str(&versioned.value)
                    .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
                state.version = versioned.version;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Load or fail with `ExecutionNotFound`.
    pub async fn load_required(&self, execution_id: ExecutionId) -> EngineResult<ExecutionState> {
        self.load(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound { execution_id })
    }

    /// Read-modify-write with OCC retries. `mutate` must be a pure function
    /// of the state it is given; it may run more than once.
    pub async fn update<F>(
        &self,
        execution_id: ExecutionId,
        mutate: F,
    ) -> EngineResult<ExecutionState>
    where
        F: Fn(&mut ExecutionState) -> EngineResult<()>,
    {
        let mut attempt = 0u32;
        loop {
            let key = keys::execution_state(execution_id);
            let versioned = self
                .store
                .get_versioned(&key)
                .await
                .map_err(EngineError::Store)?
                .ok_or(EngineError::ExecutionNotFound { execution_id })?;
            let mut state: ExecutionState = serde_json::from_str(&versioned.value)
                .map_err(|e| EngineError::Store(StoreError::Serialization(e.to_string())))?;
            state.version = versioned.version;

            mutate(&mut state)?;
            state.touch();

            match self.persist(&mut state, versioned.version).await {
                Ok(()) => return Ok(state),
                Err(EngineError::Store(StoreError::VersionConflict { .. }))
                    if attempt < self.occ.max_retries =>
                {
                    attempt += 1;
                    tracing::debug!(
                        execution_id = %execution_id,
                        attempt,
                        "version conflict, rebasing update"
                    );
                    tokio::time::sleep(self.occ.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether a cancellation tombstone exists for this execution.
    pub async fn is_cancelled(&self, execution_id: ExecutionId) -> EngineResult<bool> {
        let key = keys::tombstone(execution_id);
        Ok(self.store.get(&key).await.map_err(EngineError::Store)?.is_some())
    }
}
