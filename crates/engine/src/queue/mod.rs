//! Signed, retryable HTTP job queue
//!
//! Continuation and replan jobs are JSON payloads delivered to the engine's
//! `/engine/execute-step` endpoint. Every delivery is signed with
//! HMAC-SHA256 over the raw body; the receiving handler verifies before
//! acting. Delivery is at-least-once; handler idempotency comes from the
//! per-step locks, not from the queue.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;

use crate::config::QueueConfig;
use crate::trace::TraceContext;
use crate::types::{ExecutionId, QueueError};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "x-synapse-signature";

/// What the delivered job asks the engine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Run the next segment, starting at `start_step_index`
    #[default]
    Continuation,
    /// Consume the replan marker and rebuild the plan
    Replan,
}

/// A queued job chaining one invocation to the next.
///
/// The wire shape doubles as the `/engine/execute-step` request body, so
/// direct calls may omit everything but `executionId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationJob {
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step_index: Option<u32>,
    #[serde(default)]
    pub segment_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

impl ContinuationJob {
    pub fn continuation(
        execution_id: ExecutionId,
        start_step_index: u32,
        segment_number: u32,
        trace: TraceContext,
    ) -> Self {
        Self {
            execution_id,
            kind: JobKind::Continuation,
            start_step_index: Some(start_step_index),
            segment_number,
            trace: Some(trace),
        }
    }

    pub fn replan(execution_id: ExecutionId, segment_number: u32, trace: TraceContext) -> Self {
        Self {
            execution_id,
            kind: JobKind::Replan,
            start_step_index: None,
            segment_number,
            trace: Some(trace),
        }
    }

    /// The job's trace context, or a fresh one for direct calls.
    pub fn trace_context(&self) -> TraceContext {
        self.trace.clone().unwrap_or_default()
    }
}

/// Compute the hex HMAC-SHA256 signature for a delivery body.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, QueueError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| QueueError::SignatureInvalid(format!("HMAC init failed: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a delivery signature in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_hex: &str) -> Result<(), QueueError> {
    let provided = hex::decode(signature_hex)
        .map_err(|e| QueueError::SignatureInvalid(format!("failed to decode hex: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| QueueError::SignatureInvalid(format!("HMAC init failed: {e}")))?;
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    if computed.as_slice().ct_eq(&provided).unwrap_u8() != 1 {
        return Err(QueueError::SignatureInvalid("signature mismatch".into()));
    }
    Ok(())
}

/// Job transport abstraction.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for delivery. Resolves once the queue has accepted it.
    async fn enqueue(&self, job: ContinuationJob) -> Result<(), QueueError>;
}

/// HTTP delivery to the engine endpoint, signed and retried.
pub struct HttpJobQueue {
    client: reqwest::Client,
    config: QueueConfig,
}

impl HttpJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl JobQueue for HttpJobQueue {
    async fn enqueue(&self, job: ContinuationJob) -> Result<(), QueueError> {
        let body = serde_json::to_vec(&job)
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let signature = match &self.config.signing_secret {
            Some(secret) => Some(sign_body(secret.as_bytes(), &body)?),
            None => None,
        };

        let mut last_error = String::new();
        for attempt in 0..self.config.max_delivery_attempts {
            if attempt > 0 {
                let backoff = Duration::from_millis(
                    self.config.retry_backoff_ms * (1u64 << (attempt - 1).min(10)),
                );
                tokio::time::sleep(backoff).await;
            }

            let mut request = self
                .client
                .post(&self.config.target_url)
                .header("content-type", "application/json")
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header(SIGNATURE_HEADER, sig.clone());
            }
            if let Some(trace) = &job.trace {
                for (name, value) in trace.to_headers() {
                    request = request.header(name, value);
                }
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(
                        execution_id = %job.execution_id,
                        kind = ?job.kind,
                        attempt,
                        "continuation job delivered"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                    // 4xx other than 409 will not improve on retry.
                    if response.status().is_client_error()
                        && response.status() != reqwest::StatusCode::CONFLICT
                    {
                        break;
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        Err(QueueError::EnqueueFailed {
            attempts: self.config.max_delivery_attempts,
            reason: last_error,
        })
    }
}

/// In-process queue for tests and single-node deployments. Jobs land on a
/// channel the test harness (or embedded worker) drains.
pub struct MemoryJobQueue {
    sender: mpsc::UnboundedSender<ContinuationJob>,
}

impl MemoryJobQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ContinuationJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: ContinuationJob) -> Result<(), QueueError> {
        self.sender
            .send(job)
            .map_err(|e| QueueError::EnqueueFailed {
                attempts: 1,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let secret = b"queue-secret";
        let body = br#"{"executionId":"x"}"#;
        let sig = sign_body(secret, body).unwrap();
        assert!(verify_signature(secret, body, &sig).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let secret = b"queue-secret";
        let sig = sign_body(secret, b"original").unwrap();
        assert!(matches!(
            verify_signature(secret, b"tampered", &sig),
            Err(QueueError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let sig = sign_body(b"secret-a", b"body").unwrap();
        assert!(verify_signature(b"secret-b", b"body", &sig).is_err());
    }

    #[test]
    fn test_malformed_hex_rejected() {
        assert!(verify_signature(b"secret", b"body", "not-hex!").is_err());
    }

    #[tokio::test]
    async fn test_memory_queue_delivers() {
        let (queue, mut rx) = MemoryJobQueue::new();
        let job = ContinuationJob::continuation(ExecutionId::new(), 0, 1, TraceContext::new());
        queue.enqueue(job.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), job);
    }

    #[test]
    fn test_minimal_direct_call_body_parses() {
        // Direct API calls send only executionId (+ optional start index).
        let json = r#"{"executionId":"6f9a4a3e-26a7-4bcd-9b8e-1f55aa0d9e11",
                       "startStepIndex":0}"#;
        let job: ContinuationJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.kind, JobKind::Continuation);
        assert_eq!(job.start_step_index, Some(0));
        assert_eq!(job.segment_number, 0);
        assert!(job.trace.is_none());
    }
}
