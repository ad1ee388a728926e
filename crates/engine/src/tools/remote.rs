//! Remote tool servers
//!
//! A remote server advertises a set of tools and executes them over
//! JSON-over-HTTP. Resolution order in the executor is remote-first: the
//! first server advertising a name wins, then the local registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::registry::{CompensationRecipe, ToolFailure, ToolResponse};

/// Descriptor a server advertises per tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema the tool's output must satisfy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

/// A server hosting remotely executed tools.
#[async_trait]
pub trait RemoteToolServer: Send + Sync {
    /// Identifier for logs and diagnostics.
    fn server_id(&self) -> &str;

    /// Whether this server advertises `tool_name`.
    fn advertises(&self, tool_name: &str) -> bool;

    /// Descriptor for an advertised tool.
    fn descriptor(&self, tool_name: &str) -> Option<RemoteToolDescriptor>;

    /// Execute an advertised tool.
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolResponse, ToolFailure>;
}

/// Wire format for a remote execution response
#[derive(Debug, Deserialize)]
struct RemoteExecuteResponse {
    ok: bool,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    compensation: Option<CompensationRecipe>,
}

/// JSON-over-HTTP implementation of [`RemoteToolServer`].
pub struct HttpToolServer {
    server_id: String,
    base_url: String,
    client: reqwest::Client,
    tools: HashMap<String, RemoteToolDescriptor>,
}

impl HttpToolServer {
    /// Build a server facade from its advertised tool list (obtained at
    /// discovery time; the catalog itself is external to the engine).
    pub fn new(server_id: &str, base_url: &str, tools: Vec<RemoteToolDescriptor>) -> Self {
        Self {
            server_id: server_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl RemoteToolServer for HttpToolServer {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn advertises(&self, tool_name: &str) -> bool {
        self.tools.contains_key(tool_name)
    }

    fn descriptor(&self, tool_name: &str) -> Option<RemoteToolDescriptor> {
        self.tools.get(tool_name).cloned()
    }

    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolResponse, ToolFailure> {
        let url = format!("{}/tools/{}/execute", self.base_url, tool_name);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&serde_json::json!({ "parameters": parameters }))
            .send()
            .await
            .map_err(|e| ToolFailure::technical(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ToolFailure::technical(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ToolFailure::logical(
                "REMOTE_REJECTED",
                format!("HTTP {status}"),
            ));
        }

        let body: RemoteExecuteResponse = response
            .json()
            .await
            .map_err(|e| ToolFailure::technical(format!("malformed response: {e}")))?;

        if body.ok {
            Ok(ToolResponse {
                output: body.output.unwrap_or(serde_json::Value::Null),
                compensation: body.compensation,
            })
        } else {
            Err(ToolFailure::logical(
                body.error_code.unwrap_or_else(|| "TOOL_ERROR".into()),
                body.error.unwrap_or_else(|| "unspecified tool error".into()),
            ))
        }
    }
}
