//! In-process tool dispatch: provider plugins and local tools.
//!
//! Both the `provider` and `local` backend kinds resolve here; the kind in
//! the registered `BackendRef` records where the tool came from. Providers
//! never hold connections, so registration doubles as discovery.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::errors::{ErrorKind, ErrorObject};
use crate::index::ToolIndex;
use crate::model::{BackendRef, Tool, normalize_tags};

/// One in-process tool implementation.
#[async_trait]
pub trait ProviderTool: Send + Sync {
    /// The canonical tool record to register.
    fn tool(&self) -> Tool;
    async fn call(&self, args: Value) -> Result<Value, ErrorObject>;
}

/// Registry of in-process tools, keyed by tool id.
pub struct ProviderRegistry {
    tools: DashMap<String, Arc<dyn ProviderTool>>,
}

impl ProviderRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: DashMap::new(),
        })
    }

    /// Register a tool implementation and its index entry under the given
    /// backend ref (`Provider` or `Local`).
    pub fn register(
        &self,
        implementation: Arc<dyn ProviderTool>,
        backend: BackendRef,
        index: &ToolIndex,
    ) {
        let mut tool = implementation.tool();
        tool.normalize();
        self.tools.insert(tool.id.clone(), implementation);
        index.register_tool(tool, backend);
    }

    pub async fn call(&self, tool_id: &str, args: Value) -> Result<Value, ErrorObject> {
        let implementation = self
            .tools
            .get(tool_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| {
                ErrorObject::new(
                    ErrorKind::BackendUnavailable,
                    format!("no in-process implementation for '{tool_id}'"),
                )
                .with_tool(tool_id)
            })?;
        implementation.call(args).await
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }
}

/// Register the built-in local tools under the `local` namespace.
pub fn register_local_tools(registry: &ProviderRegistry, index: &ToolIndex) {
    for implementation in [
        Arc::new(EchoTool) as Arc<dyn ProviderTool>,
        Arc::new(TimeTool) as Arc<dyn ProviderTool>,
    ] {
        let name = implementation.tool().name;
        registry.register(implementation, BackendRef::Local { name }, index);
    }
}

/// `local:echo` — returns its arguments unchanged. Handy as a liveness probe
/// and as the smallest possible chain step.
struct EchoTool;

#[async_trait]
impl ProviderTool for EchoTool {
    fn tool(&self) -> Tool {
        let mut tool = Tool::new("local", "echo");
        tool.description = "Echo the provided arguments back as the result.".to_string();
        tool.tags = normalize_tags(["backend.local".to_string(), "utility".to_string()]);
        tool.input_schema = serde_json::json!({
            "type": "object",
            "additionalProperties": true
        });
        tool
    }

    async fn call(&self, args: Value) -> Result<Value, ErrorObject> {
        Ok(args)
    }
}

/// `local:time` — current wall-clock time in unix seconds and milliseconds.
struct TimeTool;

#[async_trait]
impl ProviderTool for TimeTool {
    fn tool(&self) -> Tool {
        let mut tool = Tool::new("local", "time");
        tool.description = "Current wall-clock time as unix seconds and milliseconds.".to_string();
        tool.tags = normalize_tags(["backend.local".to_string(), "utility".to_string()]);
        tool.input_schema = serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        });
        tool.output_schema = Some(serde_json::json!({
            "type": "object",
            "properties": {
                "unix_seconds": {"type": "integer"},
                "unix_millis": {"type": "integer"}
            },
            "required": ["unix_seconds", "unix_millis"]
        }));
        tool
    }

    async fn call(&self, _args: Value) -> Result<Value, ErrorObject> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| ErrorObject::internal("local:time"))?;
        Ok(serde_json::json!({
            "unix_seconds": now.as_secs(),
            "unix_millis": now.as_millis() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_tools_register_and_dispatch() {
        let index = ToolIndex::new();
        let registry = ProviderRegistry::new();
        register_local_tools(&registry, &index);

        let (tool, backends) = index.get_tool("local:echo").unwrap();
        assert_eq!(tool.namespace, "local");
        assert_eq!(backends[0].kind(), "local");

        let out = registry
            .call("local:echo", serde_json::json!({"msg": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn test_time_tool_matches_its_output_schema() {
        let index = ToolIndex::new();
        let registry = ProviderRegistry::new();
        register_local_tools(&registry, &index);

        let out = registry
            .call("local:time", serde_json::json!({}))
            .await
            .unwrap();
        assert!(out["unix_seconds"].is_u64());
        assert!(out["unix_millis"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_provider_tool() {
        let registry = ProviderRegistry::new();
        let err = registry
            .call("ghost:tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorKind::BackendUnavailable);
    }
}
