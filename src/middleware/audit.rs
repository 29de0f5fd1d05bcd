//! Audit middleware: one entry per invocation, success or failure.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::{CallResult, ToolCall, ToolProvider};
use crate::model::Tool;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unix milliseconds at completion.
    pub timestamp_ms: u64,
    pub tool_id: String,
    pub principal: String,
    pub tenant: Option<String>,
    pub roles: Vec<String>,
    pub duration_ms: u64,
    pub success: bool,
    /// Canonical error code when the call failed.
    pub error: Option<String>,
    pub request_id: String,
    /// Only populated when args capture is explicitly enabled.
    pub args: Option<Value>,
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, entry: &AuditEntry);
}

/// Default sink: structured tracing events under the `audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, entry: &AuditEntry) {
        info!(
            target: "audit",
            tool_id = %entry.tool_id,
            principal = %entry.principal,
            tenant = entry.tenant.as_deref().unwrap_or(""),
            roles = ?entry.roles,
            duration_ms = entry.duration_ms,
            success = entry.success,
            error = entry.error.as_deref().unwrap_or(""),
            request_id = %entry.request_id,
            "tool call"
        );
    }
}

pub struct AuditMiddleware {
    inner: Arc<dyn ToolProvider>,
    sink: Arc<dyn AuditSink>,
    include_args: bool,
}

impl AuditMiddleware {
    pub fn new(inner: Arc<dyn ToolProvider>, sink: Arc<dyn AuditSink>, include_args: bool) -> Self {
        Self {
            inner,
            sink,
            include_args,
        }
    }
}

#[async_trait]
impl ToolProvider for AuditMiddleware {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    fn tool(&self) -> Option<Tool> {
        self.inner.tool()
    }

    async fn handle(&self, call: ToolCall) -> CallResult {
        let started = Instant::now();
        let tool_id = call.tool_id.clone();
        let request_id = call.request_id.clone();
        let identity = call.identity.clone();
        let args = self
            .include_args
            .then(|| Value::Object(call.args.clone()));

        let result = self.inner.handle(call).await;

        let (principal, tenant, roles) = match &identity {
            Some(id) => (id.principal.clone(), id.tenant.clone(), id.roles.clone()),
            None => ("anonymous".to_string(), None, Vec::new()),
        };
        let entry = AuditEntry {
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            tool_id,
            principal,
            tenant,
            roles,
            duration_ms: started.elapsed().as_millis() as u64,
            success: result.is_ok(),
            error: result
                .as_ref()
                .err()
                .map(|e| e.code.code().to_string()),
            request_id,
            args,
        };
        self.sink.emit(&entry);

        result
    }
}
