//! Tool catalog trait and in-process registry
//!
//! The orchestrator never touches security data itself; it only asks a
//! `ToolCatalog` to run a named tool. The production catalog is the remote
//! MCP server (`mcp`), the registry here serves embedded and stub tools.

use crate::error::OrchestrationError;
use crate::models::{ToolDescriptor, ToolErrorKind, ToolFailure};
use crate::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod mcp;
pub mod schema;

pub use mcp::McpToolCatalog;

/// Outcome of a single catalog call.
pub type ToolCallResult = std::result::Result<Value, ToolFailure>;

/// Boundary to the external tool-execution backend. Must be safe for
/// concurrent use by many turns.
#[async_trait::async_trait]
pub trait ToolCatalog: Send + Sync {
    /// Side-channel reachability check performed before a turn starts.
    async fn health_check(&self) -> Result<()>;

    /// Tools available at this destination.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Run one tool.
    async fn call_tool(&self, name: &str, arguments: &Value) -> ToolCallResult;
}

/// Trait for a single in-process tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    async fn execute(&self, arguments: &Value) -> ToolCallResult;
}

/// Tool registry for looking up and executing in-process tools
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ToolCatalog for ToolRegistry {
    async fn health_check(&self) -> Result<()> {
        if self.tools.is_empty() {
            return Err(OrchestrationError::ToolCatalogUnreachable(
                "no tools registered".to_string(),
            ));
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.values().map(|t| t.descriptor()).collect())
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> ToolCallResult {
        match self.tools.get(name) {
            Some(tool) => tool.execute(arguments).await,
            None => Err(ToolFailure::new(
                ToolErrorKind::UnknownTool,
                format!("tool '{}' is not registered", name),
            )),
        }
    }
}

/// Tool that always answers with the same payload. Handy for demos and
/// offline runs against recorded data.
pub struct FixtureTool {
    descriptor: ToolDescriptor,
    payload: Value,
}

impl FixtureTool {
    pub fn new(descriptor: ToolDescriptor, payload: Value) -> Self {
        Self {
            descriptor,
            payload,
        }
    }
}

#[async_trait::async_trait]
impl Tool for FixtureTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, _arguments: &Value) -> ToolCallResult {
        Ok(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::empty_object_schema;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FixtureTool::new(
            ToolDescriptor::new("list_alerts", "List alerts", empty_object_schema()),
            json!([{ "endpoint": "web-01", "severity": "CRITICAL" }]),
        )));
        registry
    }

    #[tokio::test]
    async fn test_registry_call() {
        let registry = registry();
        let payload = registry.call_tool("list_alerts", &json!({})).await.unwrap();
        assert_eq!(payload[0]["endpoint"], "web-01");
        assert_eq!(registry.list(), vec!["list_alerts"]);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = registry();
        let err = registry.call_tool("nope", &json!({})).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UnknownTool);
    }

    #[tokio::test]
    async fn test_empty_registry_unhealthy() {
        let registry = ToolRegistry::new();
        assert!(registry.health_check().await.is_err());
    }
}
