//! Local tool registry
//!
//! Tools register under a unique name with an optional response schema. The
//! executor consults remote servers first; the local registry is the
//! fallback resolution tier.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A compensation recipe returned by a tool alongside its output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecipe {
    pub tool_name: String,
    pub parameters: serde_json::Value,
}

/// Successful tool response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub output: serde_json::Value,
    /// Inverse action the caller should register before proceeding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationRecipe>,
}

/// Failure classification a tool invocation can produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolFailure {
    /// Transient transport-level problem; the executor retries these
    Technical { reason: String },
    /// The tool ran and reported a domain failure; never retried here
    Logical { code: String, message: String },
}

impl ToolFailure {
    pub fn technical(reason: impl Into<String>) -> Self {
        ToolFailure::Technical {
            reason: reason.into(),
        }
    }

    pub fn logical(code: impl Into<String>, message: impl Into<String>) -> Self {
        ToolFailure::Logical {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// A locally registered tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// JSON Schema the tool's output must satisfy, if it declares one.
    fn response_schema(&self) -> Option<&serde_json::Value> {
        None
    }

    /// Invoke the tool with the given parameters.
    async fn invoke(&self, parameters: serde_json::Value) -> Result<ToolResponse, ToolFailure>;
}

/// Name-keyed registry of local tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any previous registration under the name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| Arc::clone(&t))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            parameters: serde_json::Value,
        ) -> Result<ToolResponse, ToolFailure> {
            Ok(ToolResponse {
                output: parameters,
                compensation: None,
            })
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let tool = registry.get("echo").unwrap();
        let response = tool.invoke(serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(response.output, serde_json::json!({"a": 1}));
        assert!(!registry.contains("missing"));
    }
}
