//! The meta-operation service: the logic behind every public tool, kept
//! transport-free so the MCP layer stays a thin shell and the operations are
//! testable end-to-end without a wire.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::backend::BackendManager;
use crate::errors::{ErrorKind, ErrorObject};
use crate::executor::{ExecuteCodeOutput, ExecutorBridge};
use crate::index::{IndexError, ToolIndex, ToolSummary};
use crate::middleware::{ToolCall, ToolProvider};
use crate::model::{Tool, ToolExample};
use crate::runner::{ChainOutcome, ChainRunner, ChainStep, RunResult};
use crate::skills::{Plan, Skill, SkillCatalog, SkillOverrides, Toolset};

/// Hard cap on examples returned per tool, regardless of the caller's `max`.
pub const EXAMPLES_CAP: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SearchToolsOutput {
    pub tools: Vec<ToolSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListNamespacesOutput {
    pub namespaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    Summary,
    Schema,
    Full,
}

impl FromStr for DetailLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(DetailLevel::Summary),
            "schema" => Ok(DetailLevel::Schema),
            "full" => Ok(DetailLevel::Full),
            other => Err(format!(
                "invalid detail_level '{other}', expected summary|schema|full"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaInfo {
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub required: Vec<String>,
    pub properties: Vec<String>,
}

/// `summary` omits `tool` and `schema_info`; `schema` includes both; `full`
/// adds notes, examples and external refs. Absent optionals serialize as
/// genuine nulls, never empty containers.
#[derive(Debug, Clone, Serialize)]
pub struct DescribeToolOutput {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_info: Option<SchemaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub examples: Vec<ToolExample>,
    pub external_refs: Vec<String>,
}

/// Everything the meta-operations need, wired once at server init.
pub struct MetaService {
    pub index: Arc<ToolIndex>,
    pub manager: Arc<BackendManager>,
    /// The full middleware chain around the runner.
    pub dispatcher: Arc<dyn ToolProvider>,
    pub chains: Arc<ChainRunner>,
    pub skills: Arc<SkillCatalog>,
    pub executor: Arc<ExecutorBridge>,
}

impl MetaService {
    pub async fn search_tools(
        &self,
        query: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<SearchToolsOutput, IndexError> {
        self.manager.maybe_refresh(&self.index).await;
        let (tools, next_cursor) = self.index.search_page(query, limit, cursor)?;
        Ok(SearchToolsOutput { tools, next_cursor })
    }

    pub async fn list_namespaces(
        &self,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<ListNamespacesOutput, IndexError> {
        self.manager.maybe_refresh(&self.index).await;
        let (namespaces, next_cursor) = self.index.list_namespaces_page(limit, cursor)?;
        Ok(ListNamespacesOutput {
            namespaces,
            next_cursor,
        })
    }

    pub async fn describe_tool(
        &self,
        tool_id: &str,
        detail: DetailLevel,
        examples_max: Option<usize>,
    ) -> Result<DescribeToolOutput, IndexError> {
        self.manager.maybe_refresh(&self.index).await;
        let (tool, _backends) = self.index.get_tool(tool_id)?;

        let summary = tool.summary_line();
        let mut output = DescribeToolOutput {
            summary,
            tool: None,
            schema_info: None,
            notes: None,
            examples: Vec::new(),
            external_refs: Vec::new(),
        };

        if matches!(detail, DetailLevel::Schema | DetailLevel::Full) {
            output.schema_info = Some(schema_info(&tool));
            output.tool = Some(tool.clone());
        }
        if detail == DetailLevel::Full {
            output.notes = tool
                .meta
                .get("notes")
                .and_then(|v| v.as_str())
                .map(String::from);
            output.examples = cap_examples(&tool.examples, examples_max);
            output.external_refs = tool.external_refs.clone();
        }
        Ok(output)
    }

    pub fn list_tool_examples(
        &self,
        tool_id: &str,
        max: Option<usize>,
    ) -> Result<Vec<ToolExample>, IndexError> {
        let (tool, _) = self.index.get_tool(tool_id)?;
        Ok(cap_examples(&tool.examples, max))
    }

    /// One tool invocation through the full dispatch chain.
    pub async fn run_tool(&self, call: ToolCall) -> Result<RunResult, ErrorObject> {
        self.manager.maybe_refresh(&self.index).await;
        self.dispatcher.handle(call).await
    }

    /// Streaming runs always fail: no current backend session advertises
    /// streaming. MCP backends answer through the manager so the error names
    /// the backend; everything else gets the generic refusal.
    pub fn run_tool_stream(&self, tool_id: &str) -> ErrorObject {
        let backends = self.index.get_all_backends(tool_id);
        if let Some(crate::model::BackendRef::Mcp { server_name }) = backends.first()
            && let Err(e) = self.manager.call_tool_stream(server_name)
        {
            return e.to_error_object().with_tool(tool_id).with_op("run");
        }
        ErrorObject::new(
            ErrorKind::StreamNotSupported,
            "streaming runs are not supported",
        )
        .with_tool(tool_id)
        .with_op("run")
    }

    pub async fn run_chain(&self, steps: Vec<ChainStep>, template: &ToolCall) -> ChainOutcome {
        self.manager.maybe_refresh(&self.index).await;
        self.chains.run_chain(&steps, template).await
    }

    pub async fn execute_code(
        &self,
        language: &str,
        code: &str,
        timeout_ms: Option<u64>,
        max_tool_calls: Option<u32>,
    ) -> Result<ExecuteCodeOutput, ErrorObject> {
        self.executor
            .execute(language, code, timeout_ms, max_tool_calls)
            .await
    }

    pub fn list_toolsets(&self) -> Vec<Toolset> {
        self.skills.toolsets()
    }

    pub fn describe_toolset(&self, toolset_id: &str) -> Result<Toolset, ErrorObject> {
        self.skills.toolset(toolset_id).ok_or_else(|| {
            ErrorObject::new(
                ErrorKind::ValidationInput,
                format!("unknown toolset '{toolset_id}'"),
            )
        })
    }

    pub fn list_skills(&self) -> Vec<Skill> {
        self.skills.skills()
    }

    pub fn describe_skill(&self, skill_id: &str) -> Result<Skill, ErrorObject> {
        self.skills.skill(skill_id).ok_or_else(|| {
            ErrorObject::new(
                ErrorKind::ValidationInput,
                format!("unknown skill '{skill_id}'"),
            )
        })
    }

    pub fn plan_skill(&self, skill_id: &str) -> Result<Plan, ErrorObject> {
        self.skills.plan(skill_id)
    }

    pub async fn run_skill(
        &self,
        skill_id: &str,
        template: &ToolCall,
        overrides: &SkillOverrides,
    ) -> Result<ChainOutcome, ErrorObject> {
        self.manager.maybe_refresh(&self.index).await;
        self.skills
            .run(skill_id, &self.chains, template, overrides)
            .await
    }
}

fn schema_info(tool: &Tool) -> SchemaInfo {
    let required = tool
        .input_schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    let properties = tool
        .input_schema
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    SchemaInfo {
        input: tool.input_schema.clone(),
        output: tool.output_schema.clone(),
        required,
        properties,
    }
}

fn cap_examples(examples: &[ToolExample], max: Option<usize>) -> Vec<ToolExample> {
    let cap = max.unwrap_or(EXAMPLES_CAP).min(EXAMPLES_CAP);
    examples.iter().take(cap).cloned().collect()
}
