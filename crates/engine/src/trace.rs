//! Explicit trace context threaded through every call
//!
//! Replaces any notion of ambient "current trace" state. The context crosses
//! HTTP boundaries via `to_headers`/`from_headers` and rides inside queue
//! jobs and bus events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Correlation identifiers for one causal chain of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl TraceContext {
    /// Start a fresh trace.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
            correlation_id: None,
        }
    }

    /// Derive a child span within the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: Some(self.span_id.clone()),
            correlation_id: self.correlation_id.clone(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Serialize for an outbound HTTP call.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (TRACE_ID_HEADER.to_string(), self.trace_id.clone()),
            (SPAN_ID_HEADER.to_string(), self.span_id.clone()),
        ];
        if let Some(parent) = &self.parent_span_id {
            headers.push((PARENT_SPAN_ID_HEADER.to_string(), parent.clone()));
        }
        if let Some(corr) = &self.correlation_id {
            headers.push((CORRELATION_ID_HEADER.to_string(), corr.clone()));
        }
        headers
    }

    /// Reconstruct from inbound headers; starts a new trace when absent.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut trace_id = None;
        let mut span_id = None;
        let mut parent_span_id = None;
        let mut correlation_id = None;
        for (name, value) in headers {
            match name.to_ascii_lowercase().as_str() {
                TRACE_ID_HEADER => trace_id = Some(value.to_string()),
                SPAN_ID_HEADER => span_id = Some(value.to_string()),
                PARENT_SPAN_ID_HEADER => parent_span_id = Some(value.to_string()),
                CORRELATION_ID_HEADER => correlation_id = Some(value.to_string()),
                _ => {}
            }
        }
        match trace_id {
            Some(trace_id) => Self {
                trace_id,
                span_id: span_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                parent_span_id,
                correlation_id,
            },
            None => Self::new(),
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}
