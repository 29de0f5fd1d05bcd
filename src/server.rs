//! The MCP surface: a fixed set of meta-operations over whatever catalog the
//! index currently holds. Handlers validate input, delegate to `MetaService`
//! and shape results; protocol errors become JSON-RPC errors while execution
//! failures become tool-error results carrying a structured `ErrorObject`.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::ErrorObject;
use crate::meta::{DetailLevel, MetaService};
use crate::middleware::ToolCall;
use crate::runner::{ChainOutcome, ChainStep, RunOptions};
use crate::skills::SkillOverrides;

// --- Parameter structs for each meta-operation ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchToolsParams {
    /// Search query over tool names, namespaces, descriptions and tags.
    /// Empty returns the full catalog in stable order.
    #[serde(default)]
    pub query: String,
    /// Page size, clamped to 1..=100 (default 20).
    #[serde(default)]
    pub limit: Option<usize>,
    /// Opaque cursor from a previous page.
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListNamespacesParams {
    /// Page size, clamped to 1..=100 (default 20).
    #[serde(default)]
    pub limit: Option<usize>,
    /// Opaque cursor from a previous page.
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DescribeToolParams {
    /// Canonical tool id, `namespace:name`.
    pub tool_id: String,
    /// Detail level: "summary", "schema" or "full".
    #[serde(default = "default_detail")]
    pub detail_level: String,
    /// Cap on returned examples (only at detail_level "full").
    #[serde(default)]
    pub examples_max: Option<usize>,
}

fn default_detail() -> String {
    "summary".to_string()
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ListToolExamplesParams {
    /// Canonical tool id, `namespace:name`.
    pub tool_id: String,
    /// Cap on returned examples.
    #[serde(default)]
    pub max: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunToolParams {
    /// Canonical tool id, `namespace:name`.
    pub tool_id: String,
    /// Arguments object validated against the tool's input schema.
    #[serde(default)]
    pub args: Option<Value>,
    /// Request a streaming run (not supported by this server).
    #[serde(default)]
    pub stream: bool,
    /// Per-call backend override (rejected by this server).
    #[serde(default)]
    pub backend_override: Option<String>,
    /// Include the tool descriptor in the result.
    #[serde(default)]
    pub include_tool: bool,
    /// Include the dispatched backend descriptor in the result.
    #[serde(default)]
    pub include_backend: bool,
    /// Include the raw MCP payload in the result.
    #[serde(default)]
    pub include_mcp_result: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ChainStepParams {
    /// Canonical tool id, `namespace:name`.
    pub tool_id: String,
    /// Arguments object for this step.
    #[serde(default)]
    pub args: Option<Value>,
    /// Inject the previous step's structured output under `previous`.
    #[serde(default)]
    pub use_previous: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunChainParams {
    /// Steps executed strictly in order; the chain stops at the first failure.
    pub steps: Vec<ChainStepParams>,
    /// Include backend descriptors in each step result.
    #[serde(default)]
    pub include_backends: bool,
    /// Include tool descriptors in each step result.
    #[serde(default)]
    pub include_tools: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ExecuteCodeParams {
    /// Language of the code snippet (must match a configured executor).
    pub language: String,
    pub code: String,
    /// Execution deadline in milliseconds, clamped to the configured maximum.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Cap on tool calls the snippet may make, clamped to the configured maximum.
    #[serde(default)]
    pub max_tool_calls: Option<u32>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DescribeToolsetParams {
    pub toolset_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SkillIdParams {
    pub skill_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunSkillParams {
    pub skill_id: String,
    /// Override on the configured step limit; the tighter value wins.
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Override on the configured tool-call limit; the tighter value wins.
    #[serde(default)]
    pub max_tool_calls: Option<usize>,
    /// Override on the configured deadline; the tighter value wins.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// The MCP server shell around the meta-operation service.
#[derive(Clone)]
pub struct MetamuxServer {
    meta: Arc<MetaService>,
    tool_router: ToolRouter<Self>,
}

impl MetamuxServer {
    pub fn new(meta: Arc<MetaService>) -> Self {
        Self {
            meta,
            tool_router: Self::tool_router(),
        }
    }
}

/// Copy transport headers out of the request context so auth can read them
/// without owning the transport. Stdio requests carry no headers.
fn headers_from_context(ctx: &RequestContext<RoleServer>) -> HashMap<String, String> {
    ctx.extensions
        .get::<http::request::Parts>()
        .map(|parts| {
            parts
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn reject_cancelled(ctx: &RequestContext<RoleServer>) -> Result<(), McpError> {
    if ctx.ct.is_cancelled() {
        return Err(McpError::invalid_request(
            "request was cancelled before dispatch",
            None,
        ));
    }
    Ok(())
}

fn args_object(args: Option<Value>) -> Result<serde_json::Map<String, Value>, McpError> {
    match args {
        None | Some(Value::Null) => Ok(serde_json::Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(McpError::invalid_params(
            format!("args must be an object, got {}", json_type_name(&other)),
            None,
        )),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Success: the payload rides as structured content.
fn ok_result<T: serde::Serialize>(payload: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_value(payload)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::structured(json))
}

/// Tool-error: `isError` plus one text content; the `ErrorObject` also rides
/// as structured content for programmatic inspection.
fn tool_error(error: &ErrorObject) -> CallToolResult {
    let mut result = CallToolResult::error(vec![Content::text(error.message.clone())]);
    result.structured_content = Some(serde_json::json!({"error": error}));
    result
}

/// Chains report partial progress even on failure: the structured payload
/// always carries `results`, and `isError` reflects the aggregate error.
fn chain_result(outcome: &ChainOutcome) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_value(outcome)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    match &outcome.error {
        Some(error) => {
            let mut result = CallToolResult::error(vec![Content::text(error.message.clone())]);
            result.structured_content = Some(json);
            Ok(result)
        }
        None => Ok(CallToolResult::structured(json)),
    }
}

#[tool_router]
impl MetamuxServer {
    #[tool(
        description = "Search the aggregated tool catalog. Returns compact summaries ranked by relevance; empty query lists everything in stable order. Paginate with the returned cursor."
    )]
    async fn search_tools(
        &self,
        Parameters(params): Parameters<SearchToolsParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        match self
            .meta
            .search_tools(&params.query, params.limit, params.cursor.as_deref())
            .await
        {
            Ok(output) => ok_result(&output),
            Err(e) => Err(McpError::invalid_params(e.to_string(), None)),
        }
    }

    #[tool(description = "List tool namespaces in lexicographic order, with cursor pagination.")]
    async fn list_namespaces(
        &self,
        Parameters(params): Parameters<ListNamespacesParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        match self
            .meta
            .list_namespaces(params.limit, params.cursor.as_deref())
            .await
        {
            Ok(output) => ok_result(&output),
            Err(e) => Err(McpError::invalid_params(e.to_string(), None)),
        }
    }

    #[tool(
        description = "Describe one tool. detail_level: \"summary\" (one line), \"schema\" (adds the full record and schema info), \"full\" (adds notes, examples and external refs)."
    )]
    async fn describe_tool(
        &self,
        Parameters(params): Parameters<DescribeToolParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        let detail: DetailLevel = params
            .detail_level
            .parse()
            .map_err(|e: String| McpError::invalid_params(e, None))?;
        match self
            .meta
            .describe_tool(&params.tool_id, detail, params.examples_max)
            .await
        {
            Ok(output) => ok_result(&output),
            Err(e @ crate::index::IndexError::NotFound(_)) => Ok(tool_error(&e.to_error_object())),
            Err(e) => Err(McpError::invalid_params(e.to_string(), None)),
        }
    }

    #[tool(description = "List worked examples attached to a tool.")]
    async fn list_tool_examples(
        &self,
        Parameters(params): Parameters<ListToolExamplesParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        match self.meta.list_tool_examples(&params.tool_id, params.max) {
            Ok(examples) => ok_result(&serde_json::json!({"examples": examples})),
            Err(e @ crate::index::IndexError::NotFound(_)) => Ok(tool_error(&e.to_error_object())),
            Err(e) => Err(McpError::invalid_params(e.to_string(), None)),
        }
    }

    #[tool(
        description = "Run one tool by id through the dispatch pipeline. Arguments are validated against the tool's input schema before dispatch."
    )]
    async fn run_tool(
        &self,
        Parameters(params): Parameters<RunToolParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        if params.stream {
            return Ok(tool_error(&self.meta.run_tool_stream(&params.tool_id)));
        }

        let args = args_object(params.args)?;
        let call = ToolCall::new(&params.tool_id, args)
            .with_headers(headers_from_context(&ctx))
            .with_options(RunOptions {
                backend_override: params.backend_override,
                include_tool: params.include_tool,
                include_backend: params.include_backend,
                include_raw: params.include_mcp_result,
            })
            .with_cancel(ctx.ct.clone());

        match self.meta.run_tool(call).await {
            Ok(result) => ok_result(&result),
            Err(error) => Ok(tool_error(&error)),
        }
    }

    #[tool(
        description = "Run a sequence of tool calls. Steps execute strictly in order; use_previous injects the prior step's structured output under the `previous` argument. Stops at the first failure, preserving completed step results."
    )]
    async fn run_chain(
        &self,
        Parameters(params): Parameters<RunChainParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        let mut steps = Vec::with_capacity(params.steps.len());
        for step in params.steps {
            steps.push(ChainStep {
                tool_id: step.tool_id,
                args: args_object(step.args)?,
                use_previous: step.use_previous,
            });
        }

        let template = ToolCall::new("", serde_json::Map::new())
            .with_headers(headers_from_context(&ctx))
            .with_options(RunOptions {
                backend_override: None,
                include_tool: params.include_tools,
                include_backend: params.include_backends,
                include_raw: false,
            })
            .with_cancel(ctx.ct.clone());

        let outcome = self.meta.run_chain(steps, &template).await;
        chain_result(&outcome)
    }

    #[tool(
        description = "Execute a code snippet in an external sandbox with bounded runtime and tool-call budget."
    )]
    async fn execute_code(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        match self
            .meta
            .execute_code(
                &params.language,
                &params.code,
                params.timeout_ms,
                params.max_tool_calls,
            )
            .await
        {
            Ok(output) => ok_result(&output),
            Err(error) => Ok(tool_error(&error)),
        }
    }

    #[tool(description = "List configured toolsets.")]
    async fn list_toolsets(
        &self,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        ok_result(&serde_json::json!({"toolsets": self.meta.list_toolsets()}))
    }

    #[tool(description = "Describe one toolset, including its member tool ids.")]
    async fn describe_toolset(
        &self,
        Parameters(params): Parameters<DescribeToolsetParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        match self.meta.describe_toolset(&params.toolset_id) {
            Ok(toolset) => ok_result(&toolset),
            Err(error) => Ok(tool_error(&error)),
        }
    }

    #[tool(description = "List configured skills.")]
    async fn list_skills(
        &self,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        ok_result(&serde_json::json!({"skills": self.meta.list_skills()}))
    }

    #[tool(description = "Describe one skill, including its steps and toolset binding.")]
    async fn describe_skill(
        &self,
        Parameters(params): Parameters<SkillIdParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        match self.meta.describe_skill(&params.skill_id) {
            Ok(skill) => ok_result(&skill),
            Err(error) => Ok(tool_error(&error)),
        }
    }

    #[tool(
        description = "Compile a skill into its execution plan without running it. Planning validates step ids, toolset membership and guards."
    )]
    async fn plan_skill(
        &self,
        Parameters(params): Parameters<SkillIdParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        match self.meta.plan_skill(&params.skill_id) {
            Ok(plan) => ok_result(&plan),
            Err(error) => Ok(tool_error(&error)),
        }
    }

    #[tool(
        description = "Plan and run a skill. Caller limits clamp against configured defaults; the tighter value wins."
    )]
    async fn run_skill(
        &self,
        Parameters(params): Parameters<RunSkillParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        reject_cancelled(&ctx)?;
        let template = ToolCall::new("", serde_json::Map::new())
            .with_headers(headers_from_context(&ctx))
            .with_cancel(ctx.ct.clone());
        let overrides = SkillOverrides {
            max_steps: params.max_steps,
            max_tool_calls: params.max_tool_calls,
            timeout_ms: params.timeout_ms,
        };
        match self
            .meta
            .run_skill(&params.skill_id, &template, &overrides)
            .await
        {
            Ok(outcome) => chain_result(&outcome),
            Err(error) => Ok(tool_error(&error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::runner::StepResult;

    #[test]
    fn test_tool_error_shape() {
        let error = ErrorObject::new(ErrorKind::RateLimited, "rate limit exceeded for tool:ns:t")
            .with_tool("ns:t");
        let result = tool_error(&error);

        assert_eq!(result.is_error, Some(true));
        let structured = result.structured_content.unwrap();
        assert_eq!(structured["error"]["code"], "rate_limited");
        assert_eq!(structured["error"]["retryable"], true);
        assert_eq!(structured["error"]["tool_id"], "ns:t");
    }

    #[test]
    fn test_chain_result_failure_shape() {
        let cause = ErrorObject::new(ErrorKind::ExecutionFailed, "boom");
        let outcome = ChainOutcome {
            results: vec![
                StepResult {
                    tool_id: "ns:t1".to_string(),
                    value: Some(serde_json::json!({"ok": 1})),
                    error: None,
                    duration_ms: 1,
                    tool: None,
                    backend: None,
                },
                StepResult {
                    tool_id: "ns:t2".to_string(),
                    value: None,
                    error: Some(cause.clone()),
                    duration_ms: 1,
                    tool: None,
                    backend: None,
                },
            ],
            final_value: Some(serde_json::json!({"ok": 1})),
            error: Some(ErrorObject::chain_step_failed(1, &cause)),
        };

        let result = chain_result(&outcome).unwrap();
        assert_eq!(result.is_error, Some(true));
        let structured = result.structured_content.unwrap();
        assert_eq!(structured["results"].as_array().unwrap().len(), 2);
        assert_eq!(structured["results"][0]["error"], Value::Null);
        assert_eq!(structured["results"][1]["error"]["code"], "execution_failed");
        assert_eq!(structured["error"]["code"], "chain_step_failed");
        assert_eq!(structured["error"]["step_index"], 1);
        assert_eq!(structured["error"]["details"]["cause_code"], "execution_failed");
    }

    #[test]
    fn test_chain_result_success_shape() {
        let outcome = ChainOutcome {
            results: vec![StepResult {
                tool_id: "ns:t1".to_string(),
                value: Some(Value::Null),
                error: None,
                duration_ms: 1,
                tool: None,
                backend: None,
            }],
            final_value: Some(Value::Null),
            error: None,
        };
        let result = chain_result(&outcome).unwrap();
        assert_ne!(result.is_error, Some(true));
        assert!(result.structured_content.is_some());
    }

    #[test]
    fn test_args_object_rejects_non_objects() {
        assert!(args_object(None).unwrap().is_empty());
        assert!(args_object(Some(Value::Null)).unwrap().is_empty());
        assert_eq!(
            args_object(Some(serde_json::json!({"a": 1}))).unwrap()["a"],
            1
        );
        assert!(args_object(Some(serde_json::json!([1, 2]))).is_err());
        assert!(args_object(Some(serde_json::json!("nope"))).is_err());
    }
}

#[tool_handler]
impl ServerHandler for MetamuxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "metamux is a meta-tool dispatcher: one stable MCP surface over many tool \
                 backends.\n\n\
                 Backend tools are NOT exposed as direct MCP tools. Discover them with \
                 search_tools / list_namespaces, inspect with describe_tool, then invoke via \
                 run_tool (single call), run_chain (sequential steps with use_previous data \
                 flow), or run_skill (named, planned sequences).\n\n\
                 ## Workflow\n\
                 1. search_tools(\"your task\") → ranked summaries with tool ids\n\
                 2. describe_tool(tool_id, detail_level=\"schema\") → input schema\n\
                 3. run_tool(tool_id, args) → structured result\n\n\
                 Errors come back as structured objects with a stable `code` and a \
                 `retryable` flag."
                    .into(),
            ),
        }
    }
}
