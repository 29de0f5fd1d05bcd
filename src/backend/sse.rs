use anyhow::{Context, Result};
use rmcp::{
    ServiceExt, model::*, service::RunningService, transport::sse_client::SseClientTransport,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::Connection;

/// An SSE MCP connection for backends that only speak the older SSE transport.
pub struct SseConnection {
    name: String,
    url: String,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    alive: AtomicBool,
}

impl SseConnection {
    pub fn new(name: String, url: String) -> Self {
        Self {
            name,
            url,
            service: RwLock::new(None),
            alive: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Connection for SseConnection {
    async fn connect(&self) -> Result<()> {
        let transport = SseClientTransport::start(self.url.clone())
            .await
            .with_context(|| format!("failed to open SSE stream for backend '{}'", self.name))?;

        let service = ().serve(transport).await.with_context(|| {
            format!("failed MCP handshake with SSE backend '{}' at {}", self.name, self.url)
        })?;

        info!(backend = %self.name, url = %self.url, "SSE MCP handshake complete");
        *self.service.write().await = Some(service);
        self.alive.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.alive.store(false, Ordering::Release);
        let mut guard = self.service.write().await;
        if let Some(service) = guard.take()
            && let Err(e) = service.cancel().await
        {
            error!(backend = %self.name, error = %e, "error cancelling SSE service");
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not connected", self.name))?;
        service
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("tools/list on '{}' failed: {e}", self.name))
    }

    async fn call_tool(&self, tool_name: &str, args: Option<Value>) -> Result<CallToolResult> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not connected", self.name))?;

        let params = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: args.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        debug!(backend = %self.name, tool = %tool_name, "calling tool via SSE");
        service
            .call_tool(params)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    fn connected(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
