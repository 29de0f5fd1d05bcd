//! Remote MCP backend management: connection lifecycle, tool discovery,
//! staleness-driven refresh and reconciliation against the index.

pub mod http;
pub mod sse;
pub mod stdio;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use rmcp::model::{CallToolResult, RawContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::errors::{ErrorKind, ErrorObject};
use crate::index::ToolIndex;
use crate::model::{Tool, normalize_tags};

// Connection state words shared by the manager and the transports.
pub(crate) const STATE_CONFIGURED: u8 = 0;
pub(crate) const STATE_CONNECTING: u8 = 1;
pub(crate) const STATE_CONNECTED: u8 = 2;
pub(crate) const STATE_REFRESHING: u8 = 3;
pub(crate) const STATE_DISCONNECTED: u8 = 4;
pub(crate) const STATE_FAILED: u8 = 5;

/// Timeout for the lazy connect performed on first use of a backend.
const CONNECT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a managed backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Configured,
    Connecting,
    Connected,
    Refreshing,
    Disconnected,
    Failed,
}

fn state_from_atomic(state: &AtomicU8) -> ConnectionState {
    match state.load(Ordering::Acquire) {
        STATE_CONFIGURED => ConnectionState::Configured,
        STATE_CONNECTING => ConnectionState::Connecting,
        STATE_CONNECTED => ConnectionState::Connected,
        STATE_REFRESHING => ConnectionState::Refreshing,
        STATE_DISCONNECTED => ConnectionState::Disconnected,
        _ => ConnectionState::Failed,
    }
}

fn store_state(atomic: &AtomicU8, state: ConnectionState) {
    let val = match state {
        ConnectionState::Configured => STATE_CONFIGURED,
        ConnectionState::Connecting => STATE_CONNECTING,
        ConnectionState::Connected => STATE_CONNECTED,
        ConnectionState::Refreshing => STATE_REFRESHING,
        ConnectionState::Disconnected => STATE_DISCONNECTED,
        ConnectionState::Failed => STATE_FAILED,
    };
    atomic.store(val, Ordering::Release);
}

/// Typed backend errors; no fragile string matching downstream.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend '{name}' is not configured")]
    UnknownBackend { name: String },

    #[error("backend '{name}' connect failed: {source}")]
    ConnectFailed { name: String, source: anyhow::Error },

    #[error("tool discovery on backend '{name}' failed: {source}")]
    ListFailed { name: String, source: anyhow::Error },

    #[error("tool call '{tool}' on backend '{name}' failed: {source}")]
    CallFailed {
        name: String,
        tool: String,
        source: anyhow::Error,
    },

    #[error("backend '{name}' does not support streaming")]
    StreamNotSupported { name: String },
}

impl BackendError {
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            BackendError::StreamNotSupported { .. } => {
                ErrorObject::new(ErrorKind::StreamNotSupported, self.to_string())
            }
            _ => ErrorObject::new(ErrorKind::BackendUnavailable, self.to_string()),
        }
    }
}

/// The interpreted response of one backend tool call.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub is_error: bool,
    /// Concatenated text content (the error message when `is_error`).
    pub text: String,
    pub structured: Option<Value>,
    /// Raw MCP result, returned to callers on request.
    pub raw: Value,
}

/// Map an rmcp `CallToolResult` into the canonical outcome shape.
pub(crate) fn map_call_tool_result(result: CallToolResult) -> ToolCallOutcome {
    let raw = serde_json::to_value(&result).unwrap_or(Value::Null);
    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    let structured = result.structured_content.clone().or_else(|| {
        // Fall back to parsing a lone text content as JSON, else wrap it.
        (!text.is_empty())
            .then(|| serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone())))
    });
    ToolCallOutcome {
        is_error: result.is_error.unwrap_or(false),
        text,
        structured,
        raw,
    }
}

/// Normalize a discovered MCP tool into the canonical model: namespace
/// `mcp.<server_name>`, provenance tags appended then normalized.
pub(crate) fn normalize_discovered(server_name: &str, raw: rmcp::model::Tool) -> Tool {
    let mut tool = Tool::new(format!("mcp.{server_name}"), raw.name.to_string());
    tool.description = raw.description.map(|d| d.to_string()).unwrap_or_default();
    tool.input_schema = serde_json::to_value(raw.input_schema.as_ref())
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
    tool.output_schema = raw
        .output_schema
        .as_ref()
        .and_then(|s| serde_json::to_value(s.as_ref()).ok());
    tool.tags = normalize_tags(["backend.mcp".to_string(), format!("server.{server_name}")]);
    tool.normalize();
    tool
}

/// One MCP session seam (streamable HTTP, SSE or stdio). The manager owns
/// the state machine; transports own the wire.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>>;
    async fn call_tool(&self, tool_name: &str, args: Option<Value>) -> Result<CallToolResult>;
    fn connected(&self) -> bool;
}

/// Connection settings for one remote MCP backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub name: String,
    /// `http(s)://` → streamable HTTP, `sse://` → SSE, `stdio:CMD ARGS` → child process.
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

/// Refresh policy for backend tool discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshPolicy {
    /// Period of the background refresh loop; zero disables it.
    #[serde(
        default = "default_refresh_interval",
        with = "crate::config::humantime_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_refresh_jitter",
        with = "crate::config::humantime_duration"
    )]
    pub jitter: Duration,
    /// On-demand refresh fires only when a backend is older than this or disconnected.
    #[serde(
        default = "default_stale_after",
        with = "crate::config::humantime_duration"
    )]
    pub stale_after: Duration,
    #[serde(default = "default_true")]
    pub on_demand: bool,
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_refresh_jitter() -> Duration {
    Duration::from_secs(30)
}
fn default_stale_after() -> Duration {
    Duration::from_secs(600)
}
fn default_true() -> bool {
    true
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval: default_refresh_interval(),
            jitter: default_refresh_jitter(),
            stale_after: default_stale_after(),
            on_demand: true,
        }
    }
}

/// Errors accumulated over one refresh sweep; one backend failing never
/// aborts the others.
#[derive(Debug, Error)]
#[error("refresh failed for {} backend(s): {}", .failures.len(), join_failures(.failures))]
pub struct RefreshErrors {
    pub failures: Vec<(String, anyhow::Error)>,
}

fn join_failures(failures: &[(String, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

struct ManagedBackend {
    name: String,
    conn: Arc<dyn Connection>,
    state: AtomicU8,
    last_refresh: std::sync::Mutex<Option<Instant>>,
}

impl ManagedBackend {
    fn state(&self) -> ConnectionState {
        state_from_atomic(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        store_state(&self.state, state);
    }

    fn mark_refreshed(&self) {
        *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Refreshing
        ) {
            return true;
        }
        match *self.last_refresh.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(at) => at.elapsed() > stale_after,
            None => true,
        }
    }
}

/// Owns all remote MCP backend connections, keyed by unique server name.
/// Safe for concurrent use.
pub struct BackendManager {
    backends: DashMap<String, Arc<ManagedBackend>>,
    /// Refresh gate: at most one refresh sweep runs; concurrent triggers
    /// observe the in-progress one and return.
    refresh_gate: tokio::sync::Mutex<()>,
    policy: RefreshPolicy,
}

impl BackendManager {
    pub fn new(policy: RefreshPolicy) -> Arc<Self> {
        Arc::new(Self {
            backends: DashMap::new(),
            refresh_gate: tokio::sync::Mutex::new(()),
            policy,
        })
    }

    /// Register a backend from settings. The connection is constructed from
    /// the URL scheme but not yet established (`Configured` state).
    pub fn insert_backend(&self, settings: &BackendSettings) -> Result<()> {
        let conn = build_connection(settings)?;
        self.insert_connection(&settings.name, conn);
        Ok(())
    }

    /// Register a backend with an explicit connection (tests inject mocks here).
    pub fn insert_connection(&self, name: &str, conn: Arc<dyn Connection>) {
        self.backends.insert(
            name.to_string(),
            Arc::new(ManagedBackend {
                name: name.to_string(),
                conn,
                state: AtomicU8::new(STATE_CONFIGURED),
                last_refresh: std::sync::Mutex::new(None),
            }),
        );
    }

    /// Remove a backend: disconnect and drop all its index edges.
    #[allow(dead_code)]
    pub async fn remove_backend(&self, name: &str, index: &ToolIndex) {
        if let Some((_, backend)) = self.backends.remove(name) {
            if let Err(e) = backend.conn.disconnect().await {
                warn!(backend = %name, error = %e, "error disconnecting backend");
            }
            index.register_tools_from_backend(name, Vec::new());
            index.purge_orphans();
            info!(backend = %name, "backend removed");
        }
    }

    #[allow(dead_code)]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|r| r.key().clone()).collect()
    }

    #[allow(dead_code)]
    pub fn state_of(&self, name: &str) -> Option<ConnectionState> {
        self.backends.get(name).map(|r| r.value().state())
    }

    fn get(&self, name: &str) -> Result<Arc<ManagedBackend>, BackendError> {
        self.backends
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| BackendError::UnknownBackend {
                name: name.to_string(),
            })
    }

    /// Lazily connect a backend, bounded by the 5s connect ping.
    async fn ensure_connected(&self, backend: &ManagedBackend) -> Result<(), BackendError> {
        if backend.conn.connected() {
            return Ok(());
        }
        backend.set_state(ConnectionState::Connecting);
        let connect = tokio::time::timeout(CONNECT_PING_TIMEOUT, backend.conn.connect()).await;
        match connect {
            Ok(Ok(())) => {
                backend.set_state(ConnectionState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                backend.set_state(ConnectionState::Failed);
                Err(BackendError::ConnectFailed {
                    name: backend.name.clone(),
                    source: e,
                })
            }
            Err(_) => {
                backend.set_state(ConnectionState::Failed);
                Err(BackendError::ConnectFailed {
                    name: backend.name.clone(),
                    source: anyhow::anyhow!("connect timed out after {:?}", CONNECT_PING_TIMEOUT),
                })
            }
        }
    }

    /// Forward a tool call to a named backend, connecting lazily.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        args: Option<Value>,
    ) -> Result<ToolCallOutcome, BackendError> {
        let backend = self.get(server_name)?;
        self.ensure_connected(&backend).await?;

        debug!(backend = %server_name, tool = %tool_name, "forwarding tool call");
        match backend.conn.call_tool(tool_name, args).await {
            Ok(result) => Ok(map_call_tool_result(result)),
            Err(e) => {
                // A failed call usually means a lost session; the next
                // refresh tick reconnects.
                backend.set_state(ConnectionState::Disconnected);
                Err(BackendError::CallFailed {
                    name: server_name.to_string(),
                    tool: tool_name.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Streaming calls are not part of the core surface; no current session
    /// advertises streaming.
    pub fn call_tool_stream(&self, server_name: &str) -> Result<(), BackendError> {
        self.get(server_name)?;
        Err(BackendError::StreamNotSupported {
            name: server_name.to_string(),
        })
    }

    /// Refresh tool catalogs. `force` refreshes every backend (the periodic
    /// sweep); otherwise only stale or disconnected backends reconcile.
    /// Coalesced: a sweep already in progress absorbs concurrent triggers.
    pub async fn refresh_all(&self, index: &ToolIndex, force: bool) -> Result<usize, RefreshErrors> {
        let Ok(_guard) = self.refresh_gate.try_lock() else {
            debug!("refresh already in progress, coalescing");
            return Ok(0);
        };

        let targets: Vec<Arc<ManagedBackend>> = self
            .backends
            .iter()
            .map(|r| Arc::clone(r.value()))
            .filter(|b| force || b.is_stale(self.policy.stale_after))
            .collect();

        let mut refreshed = 0usize;
        let mut failures: Vec<(String, anyhow::Error)> = Vec::new();

        for backend in targets {
            match self.refresh_one(&backend, index).await {
                Ok(count) => {
                    refreshed += 1;
                    info!(backend = %backend.name, tools = count, "backend refreshed");
                }
                Err(e) => {
                    error!(backend = %backend.name, error = %e, "backend refresh failed");
                    failures.push((backend.name.clone(), anyhow::anyhow!("{e}")));
                }
            }
        }

        if force {
            index.purge_orphans();
        }

        if failures.is_empty() {
            Ok(refreshed)
        } else {
            Err(RefreshErrors { failures })
        }
    }

    async fn refresh_one(
        &self,
        backend: &ManagedBackend,
        index: &ToolIndex,
    ) -> Result<usize, BackendError> {
        self.ensure_connected(backend).await?;
        backend.set_state(ConnectionState::Refreshing);

        let raw = match backend.conn.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                backend.set_state(ConnectionState::Failed);
                return Err(BackendError::ListFailed {
                    name: backend.name.clone(),
                    source: e,
                });
            }
        };

        let tools: Vec<Tool> = raw
            .into_iter()
            .map(|t| normalize_discovered(&backend.name, t))
            .collect();
        let count = tools.len();
        index.register_tools_from_backend(&backend.name, tools);

        backend.set_state(ConnectionState::Connected);
        backend.mark_refreshed();
        Ok(count)
    }

    /// On-demand refresh from handlers: no-op unless the policy enables it
    /// and at least one backend is stale or disconnected.
    pub async fn maybe_refresh(&self, index: &ToolIndex) {
        if !self.policy.on_demand {
            return;
        }
        let any_stale = self
            .backends
            .iter()
            .any(|r| r.value().is_stale(self.policy.stale_after));
        if !any_stale {
            return;
        }
        if let Err(e) = self.refresh_all(index, false).await {
            warn!(error = %e, "on-demand refresh had failures");
        }
    }

    /// Background refresh loop, fired every `interval ± rand(0, jitter)`.
    pub fn spawn_refresh_loop(self: &Arc<Self>, index: Arc<ToolIndex>, shutdown: Arc<Notify>) {
        if self.policy.interval.is_zero() {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = manager.policy.interval.as_secs(),
                jitter_secs = manager.policy.jitter.as_secs(),
                "backend refresh loop started"
            );
            loop {
                let delay = jittered(manager.policy.interval, manager.policy.jitter);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.notified() => {
                        info!("backend refresh loop shutting down");
                        return;
                    }
                }
                if let Err(e) = manager.refresh_all(&index, true).await {
                    warn!(error = %e, "periodic refresh had failures");
                }
            }
        });
    }

    /// Disconnect every backend (shutdown path).
    pub async fn shutdown(&self) {
        for entry in self.backends.iter() {
            let backend = Arc::clone(entry.value());
            if let Err(e) = backend.conn.disconnect().await {
                warn!(backend = %backend.name, error = %e, "error disconnecting backend");
            }
            backend.set_state(ConnectionState::Disconnected);
        }
        info!("all backends disconnected");
    }
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    let mut rng = rand::rng();
    let offset_ms = rng.random_range(0..=jitter.as_millis() as u64);
    if rng.random_bool(0.5) {
        interval + Duration::from_millis(offset_ms)
    } else {
        interval
            .saturating_sub(Duration::from_millis(offset_ms))
            .max(Duration::from_secs(1))
    }
}

/// Construct a transport from the backend URL scheme.
fn build_connection(settings: &BackendSettings) -> Result<Arc<dyn Connection>> {
    let url = settings.url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Arc::new(http::HttpConnection::new(settings.clone())))
    } else if let Some(rest) = url.strip_prefix("sse://") {
        Ok(Arc::new(sse::SseConnection::new(
            settings.name.clone(),
            format!("http://{rest}"),
        )))
    } else if let Some(rest) = url.strip_prefix("sses://") {
        Ok(Arc::new(sse::SseConnection::new(
            settings.name.clone(),
            format!("https://{rest}"),
        )))
    } else if let Some(cmdline) = url.strip_prefix("stdio:") {
        let parts: Vec<String> = cmdline.split_whitespace().map(String::from).collect();
        anyhow::ensure!(
            !parts.is_empty(),
            "stdio backend '{}' has an empty command",
            settings.name
        );
        Ok(Arc::new(stdio::StdioConnection::new(
            settings.name.clone(),
            parts,
        )))
    } else {
        anyhow::bail!(
            "backend '{}' has unsupported url scheme: {url}",
            settings.name
        )
    }
}
