use anyhow::{Context, Result};
use rmcp::{
    ServiceExt,
    model::*,
    service::RunningService,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{BackendSettings, Connection};

/// A streamable-HTTP MCP connection using rmcp's reqwest-based transport.
pub struct HttpConnection {
    settings: BackendSettings,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    alive: AtomicBool,
}

impl HttpConnection {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            service: RwLock::new(None),
            alive: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Connection for HttpConnection {
    async fn connect(&self) -> Result<()> {
        let name = &self.settings.name;
        let url = self.settings.url.as_str();

        let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url.to_string());

        // Authorization goes through rmcp's auth header support; strip the
        // "Bearer " prefix since rmcp adds it back.
        if let Some(auth) = self.settings.headers.get("Authorization") {
            let token = auth.strip_prefix("Bearer ").unwrap_or(auth);
            transport_config = transport_config.auth_header(token);
        }

        // Remaining custom headers ride as reqwest defaults, which apply only
        // when the outgoing request does not already set the header.
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (key, value) in &self.settings.headers {
            if key.eq_ignore_ascii_case("Authorization") {
                continue;
            }
            match (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                (Ok(header_name), Ok(val)) => {
                    default_headers.insert(header_name, val);
                }
                _ => {
                    warn!(backend = %name, header = %key, "skipping unparseable custom header");
                }
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .context("failed to build HTTP client")?;

        let transport = StreamableHttpClientTransport::with_client(client, transport_config);

        // MCP initialize handshake
        let service = ().serve(transport).await.with_context(|| {
            format!("failed MCP handshake with HTTP backend '{name}' at {url}")
        })?;

        if let Some(peer) = service.peer_info() {
            info!(
                backend = %name,
                url = %url,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "HTTP MCP handshake complete"
            );
        } else {
            info!(backend = %name, url = %url, "HTTP MCP handshake complete (no peer info)");
        }

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
            error!(backend = %self.settings.name, error = %e, "error cancelling HTTP service");
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not connected", self.settings.name))?;
        service
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("tools/list on '{}' failed: {e}", self.settings.name))
    }

    async fn call_tool(&self, tool_name: &str, args: Option<Value>) -> Result<CallToolResult> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP backend '{}' not connected", self.settings.name))?;

        let params = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: args.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        debug!(backend = %self.settings.name, tool = %tool_name, "calling tool via HTTP");
        service
            .call_tool(params)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    fn connected(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
