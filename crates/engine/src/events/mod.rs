//! Real-time step/status events
//!
//! Delivery is at-least-once; subscribers deduplicate on
//! `(execution_id, step_id, segment_number, event_type)`. Events that must
//! not be lost go through the transactional outbox rather than being
//! published directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ExecutionId, StepId};

pub mod outbox;

pub use outbox::{OutboxDrainer, OutboxWriter};

/// Topic carrying all execution updates.
pub const UPDATES_TOPIC: &str = "nervous-system:updates";

/// Event kinds published on [`UPDATES_TOPIC`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    Checkpointed,
    FailoverPolicyTriggered,
    AutomaticReplanTriggered,
    CompensationExecuted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

/// A single status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEvent {
    pub event_type: EventType,
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl SagaEvent {
    pub fn new(event_type: EventType, execution_id: ExecutionId) -> Self {
        Self {
            event_type,
            execution_id,
            step_id: None,
            segment_number: None,
            status: None,
            message: None,
            timestamp: Utc::now(),
            trace_id: None,
        }
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_segment(mut self, segment_number: u32) -> Self {
        self.segment_number = Some(segment_number);
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn with_trace_id(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }
}

/// Pub/sub fabric for status events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. At-least-once; may duplicate under retries.
    async fn publish(&self, event: &SagaEvent) -> Result<(), String>;

    /// Subscribe to the updates topic.
    fn subscribe(&self) -> broadcast::Receiver<SagaEvent>;
}

/// In-process broadcast implementation of [`EventBus`].
pub struct MemoryEventBus {
    sender: broadcast::Sender<SagaEvent>,
}

impl MemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: &SagaEvent) -> Result<(), String> {
        // A send error only means no subscriber is currently listening.
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SagaEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = MemoryEventBus::default();
        let mut rx = bus.subscribe();
        let event = SagaEvent::new(EventType::StepCompleted, ExecutionId::new())
            .with_segment(1)
            .with_status("completed");
        bus.publish(&event).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryEventBus::default();
        let event = SagaEvent::new(EventType::StepStarted, ExecutionId::new());
        assert!(bus.publish(&event).await.is_ok());
    }
}
