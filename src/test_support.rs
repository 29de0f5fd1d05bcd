//! Test fixtures: controllable mock connections, provider tools and chain
//! providers. Compiled only under `#[cfg(test)]`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::backend::Connection;
use crate::errors::{ErrorKind, ErrorObject};
use crate::index::ToolIndex;
use crate::middleware::{CallResult, ToolCall, ToolProvider};
use crate::middleware::audit::{AuditEntry, AuditSink};
use crate::model::{BackendRef, Identity, Tool};
use crate::providers::{ProviderRegistry, ProviderTool};
use crate::runner::RunResult;

/// Build an rmcp tool record from wire-shaped JSON; avoids depending on the
/// model struct's field set.
fn rmcp_tool(name: &str) -> rmcp::model::Tool {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "description": format!("{name} description"),
        "inputSchema": {"type": "object"},
    }))
    .expect("valid tool json")
}

fn rmcp_call_result(structured: Value) -> rmcp::model::CallToolResult {
    serde_json::from_value(serde_json::json!({
        "content": [{"type": "text", "text": structured.to_string()}],
        "structuredContent": structured,
        "isError": false,
    }))
    .expect("valid call result json")
}

/// A controllable mock MCP connection. Tracks list/call counts, supports
/// error injection and runtime tool-set swaps for reconciliation tests.
pub struct MockConnection {
    tools: std::sync::Mutex<Vec<String>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_list: AtomicBool,
    list_calls: AtomicUsize,
    call_calls: AtomicUsize,
}

impl MockConnection {
    pub fn new(tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            tools: std::sync::Mutex::new(tools.iter().map(|s| s.to_string()).collect()),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            call_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock().unwrap() = tools.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn call_calls(&self) -> usize {
        self.call_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("injected connect failure");
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<rmcp::model::Tool>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("injected list failure");
        }
        Ok(self
            .tools
            .lock()
            .unwrap()
            .iter()
            .map(|name| rmcp_tool(name))
            .collect())
    }

    async fn call_tool(
        &self,
        _tool_name: &str,
        args: Option<Value>,
    ) -> Result<rmcp::model::CallToolResult> {
        self.call_calls.fetch_add(1, Ordering::SeqCst);
        Ok(rmcp_call_result(args.unwrap_or(Value::Null)))
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Behavior of a mock provider tool.
enum MockBehavior {
    Echo,
    Fixed(Value),
    Fail(String),
}

/// A configurable in-process tool for runner and handler tests.
pub struct MockProviderTool {
    namespace: String,
    name: String,
    input_schema: Value,
    output_schema: Option<Value>,
    tags: Vec<String>,
    delay: Duration,
    behavior: MockBehavior,
}

impl MockProviderTool {
    /// Echoes its arguments back as the structured result.
    pub fn echo(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            output_schema: None,
            tags: Vec::new(),
            delay: Duration::ZERO,
            behavior: MockBehavior::Echo,
        }
    }

    /// Always returns the given value.
    pub fn fixed(namespace: &str, name: &str, value: Value) -> Self {
        Self {
            behavior: MockBehavior::Fixed(value),
            ..Self::echo(namespace, name)
        }
    }

    /// Always fails with `execution_failed` and the given message.
    pub fn failing(namespace: &str, name: &str, message: &str) -> Self {
        Self {
            behavior: MockBehavior::Fail(message.to_string()),
            ..Self::echo(namespace, name)
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    #[allow(dead_code)]
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_description(self, description: &str) -> DescribedMockTool {
        DescribedMockTool {
            tool: self,
            description: description.to_string(),
        }
    }
}

/// Wrapper carrying an explicit description (for search-relevance tests).
pub struct DescribedMockTool {
    tool: MockProviderTool,
    description: String,
}

#[async_trait]
impl ProviderTool for MockProviderTool {
    fn tool(&self) -> Tool {
        let mut tool = Tool::new(self.namespace.clone(), self.name.clone());
        tool.description = format!("{} mock tool", self.name);
        tool.input_schema = self.input_schema.clone();
        tool.output_schema = self.output_schema.clone();
        tool.tags = crate::model::normalize_tags(self.tags.iter().cloned());
        tool
    }

    async fn call(&self, args: Value) -> Result<Value, ErrorObject> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            MockBehavior::Echo => Ok(args),
            MockBehavior::Fixed(value) => Ok(value.clone()),
            MockBehavior::Fail(message) => Err(ErrorObject::new(
                ErrorKind::ExecutionFailed,
                message.clone(),
            )
            .with_backend(&BackendRef::Provider {
                provider_id: "mock".to_string(),
            })),
        }
    }
}

#[async_trait]
impl ProviderTool for DescribedMockTool {
    fn tool(&self) -> Tool {
        let mut tool = self.tool.tool();
        tool.description = self.description.clone();
        tool
    }

    async fn call(&self, args: Value) -> Result<Value, ErrorObject> {
        self.tool.call(args).await
    }
}

/// Register a mock tool under the `provider:mock` backend.
pub fn register_mock_tool(
    index: &ToolIndex,
    providers: &ProviderRegistry,
    tool: impl ProviderTool + 'static,
) {
    providers.register(
        Arc::new(tool),
        BackendRef::Provider {
            provider_id: "mock".to_string(),
        },
        index,
    );
}

/// A leaf provider returning a fixed outcome.
pub struct FixedProvider {
    value: Result<Value, (ErrorKind, String)>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedProvider {
    pub fn ok(value: Value) -> Arc<dyn ToolProvider> {
        Arc::new(Self {
            value: Ok(value),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn err(kind: ErrorKind, message: &str) -> Arc<dyn ToolProvider> {
        Arc::new(Self {
            value: Err((kind, message.to_string())),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ToolProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn handle(&self, call: ToolCall) -> CallResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.value {
            Ok(value) => Ok(RunResult::bare(value.clone())),
            Err((kind, message)) => Err(ErrorObject::new(*kind, message.clone())
                .with_tool(&call.tool_id)
                .with_op("run")),
        }
    }
}

/// A leaf provider that counts invocations; `Arc`-shared so tests can read
/// the count after handing the provider to a middleware.
pub struct CountingProvider {
    inner: Arc<FixedProvider>,
}

impl CountingProvider {
    pub fn ok(value: Value) -> Self {
        Self {
            inner: Arc::new(FixedProvider {
                value: Ok(value),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn err(kind: ErrorKind, message: &str) -> Self {
        Self {
            inner: Arc::new(FixedProvider {
                value: Err((kind, message.to_string())),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn slow_ok(value: Value, delay: Duration) -> Self {
        Self {
            inner: Arc::new(FixedProvider {
                value: Ok(value),
                delay,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn provider(&self) -> Arc<dyn ToolProvider> {
        Arc::clone(&self.inner) as Arc<dyn ToolProvider>
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

/// Fails the first `failures` calls with the given kind, then succeeds.
pub struct FlakyProvider {
    state: Arc<FlakyState>,
}

struct FlakyState {
    remaining_failures: AtomicU32,
    kind: ErrorKind,
    calls: AtomicUsize,
}

impl FlakyProvider {
    pub fn new(failures: u32, kind: ErrorKind) -> Self {
        Self {
            state: Arc::new(FlakyState {
                remaining_failures: AtomicU32::new(failures),
                kind,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn provider(&self) -> Arc<dyn ToolProvider> {
        Arc::clone(&self.state) as Arc<dyn ToolProvider>
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolProvider for FlakyState {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn handle(&self, call: ToolCall) -> CallResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ErrorObject::new(self.kind, "injected failure")
                .with_tool(&call.tool_id));
        }
        Ok(RunResult::bare(Value::Null))
    }
}

/// Records the identity installed by upstream middleware.
pub struct IdentityProbe {
    state: Arc<ProbeState>,
}

struct ProbeState {
    last: std::sync::Mutex<Option<Identity>>,
}

impl IdentityProbe {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ProbeState {
                last: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn provider(&self) -> Arc<dyn ToolProvider> {
        Arc::clone(&self.state) as Arc<dyn ToolProvider>
    }

    pub fn last_identity(&self) -> Option<Identity> {
        self.state.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolProvider for ProbeState {
    fn name(&self) -> &str {
        "probe"
    }

    async fn handle(&self, call: ToolCall) -> CallResult {
        *self.last.lock().unwrap() = call.identity.clone();
        Ok(RunResult::bare(Value::Null))
    }
}

/// Audit sink collecting entries in memory.
#[derive(Default)]
pub struct CollectingSink {
    entries: std::sync::Mutex<Vec<AuditEntry>>,
}

impl CollectingSink {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl AuditSink for CollectingSink {
    fn emit(&self, entry: &AuditEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}
