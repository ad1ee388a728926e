//! Transactional outbox
//!
//! Events that must not be lost are appended to the state store alongside the
//! state write, then drained asynchronously to the event bus. The drain
//! deletes an entry only after a successful publish, which yields
//! at-least-once delivery on top of a non-transactional bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{EventBus, SagaEvent};
use crate::store::{keys, StateStore};
use crate::types::{ExecutionId, StoreError};

/// Appends events to the outbox namespace in the state store.
pub struct OutboxWriter {
    store: Arc<dyn StateStore>,
    sequence: AtomicU64,
}

impl OutboxWriter {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            sequence: AtomicU64::new(0),
        }
    }

    /// Durably record an event for later publication.
    pub async fn append(&self, event: &SagaEvent) -> Result<(), StoreError> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let key = keys::outbox_entry(event.execution_id, seq);
        let value = serde_json::to_string(event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.put(&key, &value, None).await
    }
}

/// Background task draining the outbox to the event bus.
pub struct OutboxDrainer {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    interval: Duration,
}

impl OutboxDrainer {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<dyn EventBus>, interval: Duration) -> Self {
        Self {
            store,
            bus,
            interval,
        }
    }

    /// Drain all pending entries once. Returns the number published.
    pub async fn drain_once(&self) -> Result<usize, StoreError> {
        let entries = self.store.scan_prefix(keys::OUTBOX_PREFIX).await?;
        let mut published = 0usize;
        let mut failures = 0usize;
        for (key, value) in entries {
            let event: SagaEvent = match serde_json::from_str(&value) {
                Ok(e) => e,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "dropping malformed outbox entry");
                    let _ = self.store.delete(&key).await;
                    continue;
                }
            };
            match self.bus.publish(&event).await {
                Ok(()) => {
                    // Delete only after publish; a crash here re-publishes,
                    // which subscribers absorb via deduplication.
                    let _ = self.store.delete(&key).await;
                    published += 1;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(key = %key, error = %e, "outbox publish failed, will retry");
                }
            }
        }
        if published > 0 || failures > 0 {
            tracing::debug!(published, failures, "outbox drain pass");
        }
        Ok(published)
    }

    /// Run the drain loop until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.drain_once().await {
                tracing::warn!(error = %e, "outbox drain pass failed");
            }
        }
    }

    /// Drain entries for a single execution (used on segment boundaries so
    /// completion events reach subscribers promptly).
    pub async fn drain_execution(&self, execution_id: ExecutionId) -> Result<usize, StoreError> {
        let prefix = format!("{}{}:", keys::OUTBOX_PREFIX, execution_id);
        let entries = self.store.scan_prefix(&prefix).await?;
        let mut published = 0usize;
        for (key, value) in entries {
            if let Ok(event) = serde_json::from_str::<SagaEvent>(&value) {
                if self.bus.publish(&event).await.is_ok() {
                    let _ = self.store.delete(&key).await;
                    published += 1;
                }
            }
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventType, MemoryEventBus};
    use crate::store::MemoryStateStore;

    #[tokio::test]
    async fn test_append_then_drain_publishes_in_order() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let bus = Arc::new(MemoryEventBus::default());
        let writer = OutboxWriter::new(store.clone());
        let drainer = OutboxDrainer::new(store.clone(), bus.clone(), Duration::from_secs(1));

        let execution_id = ExecutionId::new();
        let mut rx = bus.subscribe();
        let first = SagaEvent::new(EventType::StepCompleted, execution_id);
        let second = SagaEvent::new(EventType::ExecutionCompleted, execution_id);
        writer.append(&first).await.unwrap();
        writer.append(&second).await.unwrap();

        let drained = drainer.drain_once().await.unwrap();
        assert_eq!(drained, 2);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::StepCompleted);
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            EventType::ExecutionCompleted
        );

        // Entries are gone once published.
        assert!(store
            .scan_prefix(keys::OUTBOX_PREFIX)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_drain_execution_scopes_to_one_id() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let bus = Arc::new(MemoryEventBus::default());
        let writer = OutboxWriter::new(store.clone());
        let drainer = OutboxDrainer::new(store.clone(), bus.clone(), Duration::from_secs(1));

        let target = ExecutionId::new();
        let other = ExecutionId::new();
        writer
            .append(&SagaEvent::new(EventType::StepStarted, target))
            .await
            .unwrap();
        writer
            .append(&SagaEvent::new(EventType::StepStarted, other))
            .await
            .unwrap();

        assert_eq!(drainer.drain_execution(target).await.unwrap(), 1);
        let remaining = store.scan_prefix(keys::OUTBOX_PREFIX).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].0.contains(&other.to_string()));
    }
}
