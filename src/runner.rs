//! Tool execution: resolve → validate → dispatch → normalize, plus the chain
//! orchestrator that sequences multi-step executions with typed error
//! propagation.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::backend::BackendManager;
use crate::errors::{ErrorKind, ErrorObject};
use crate::index::{IndexError, ToolIndex};
use crate::middleware::{ToolCall, ToolProvider};
use crate::model::{BackendRef, Tool};
use crate::providers::ProviderRegistry;

/// Caller-controlled knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Per-call backend override; rejected unless the server supports it
    /// (this one does not).
    pub backend_override: Option<String>,
    pub include_tool: bool,
    pub include_backend: bool,
    pub include_raw: bool,
}

/// The structured result of one tool run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendRef>,
    /// Raw MCP payload, only on request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_result: Option<Value>,
    pub duration_ms: u64,
    pub cached: bool,
}

impl RunResult {
    /// A result carrying only a value; middleware tests and cache hits use this.
    pub fn bare(value: Value) -> Self {
        Self {
            value,
            tool: None,
            backend: None,
            mcp_result: None,
            duration_ms: 0,
            cached: false,
        }
    }
}

/// One step of a chain request.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub tool_id: String,
    pub args: Map<String, Value>,
    /// Inject the previous step's structured output under `previous`.
    pub use_previous: bool,
}

/// Per-step outcome; `error` is `None` on success.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub tool_id: String,
    pub value: Option<Value>,
    pub error: Option<ErrorObject>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendRef>,
}

/// Aggregate chain outcome. `final_value` is the last successful step's
/// structured output; `None` when the first step failed.
#[derive(Debug, Clone, Serialize)]
pub struct ChainOutcome {
    pub results: Vec<StepResult>,
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Resolves tools through the index and dispatches to the owning backend.
pub struct Runner {
    index: Arc<ToolIndex>,
    manager: Arc<BackendManager>,
    providers: Arc<ProviderRegistry>,
}

impl Runner {
    pub fn new(
        index: Arc<ToolIndex>,
        manager: Arc<BackendManager>,
        providers: Arc<ProviderRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            manager,
            providers,
        })
    }

    /// Run a single tool call to completion.
    pub async fn run(&self, call: &ToolCall) -> Result<RunResult, ErrorObject> {
        let started = Instant::now();

        let (tool, backends) = self.index.get_tool(&call.tool_id).map_err(|e| match e {
            IndexError::NotFound(_) => ErrorObject::new(
                ErrorKind::ToolNotFound,
                format!("tool '{}' not found", call.tool_id),
            )
            .with_tool(&call.tool_id)
            .with_op("run"),
            other => other.to_error_object(),
        })?;

        let Some(primary) = backends.first() else {
            return Err(ErrorObject::new(
                ErrorKind::NoBackends,
                format!("tool '{}' has no reachable backends", call.tool_id),
            )
            .with_tool(&call.tool_id)
            .with_op("run"));
        };

        if let Some(requested) = &call.options.backend_override {
            return Err(ErrorObject::new(
                ErrorKind::BackendOverrideInvalid,
                format!("per-call backend override '{requested}' is not supported"),
            )
            .with_tool(&call.tool_id)
            .with_op("run"));
        }

        let args_value = Value::Object(call.args.clone());
        validate_schema(
            &tool.input_schema,
            &args_value,
            ErrorKind::ValidationInput,
            &call.tool_id,
        )?;

        let dispatch = self.dispatch(&tool, primary, args_value);
        let (value, raw) = tokio::select! {
            _ = call.cancel.cancelled() => {
                return Err(ErrorObject::new(ErrorKind::Cancelled, "call cancelled")
                    .with_tool(&call.tool_id)
                    .with_op("run")
                    .with_backend(primary));
            }
            result = dispatch => result?,
        };

        if let Some(output_schema) = &tool.output_schema {
            validate_schema(
                output_schema,
                &value,
                ErrorKind::ValidationOutput,
                &call.tool_id,
            )?;
        }

        Ok(RunResult {
            value,
            tool: call.options.include_tool.then(|| tool.clone()),
            backend: call.options.include_backend.then(|| primary.clone()),
            mcp_result: if call.options.include_raw { raw } else { None },
            duration_ms: started.elapsed().as_millis() as u64,
            cached: false,
        })
    }

    /// Dispatch to the primary backend by kind. Returns the structured value
    /// and, for MCP backends, the raw payload.
    async fn dispatch(
        &self,
        tool: &Tool,
        backend: &BackendRef,
        args: Value,
    ) -> Result<(Value, Option<Value>), ErrorObject> {
        match backend {
            BackendRef::Mcp { server_name } => {
                let outcome = self
                    .manager
                    .call_tool(server_name, &tool.name, Some(args))
                    .await
                    .map_err(|e| {
                        e.to_error_object()
                            .with_tool(&tool.id)
                            .with_op("run")
                    })?;

                if outcome.is_error {
                    let message = if outcome.text.is_empty() {
                        format!("tool '{}' reported an error", tool.id)
                    } else {
                        outcome.text.clone()
                    };
                    return Err(ErrorObject::new(ErrorKind::ExecutionFailed, message)
                        .with_tool(&tool.id)
                        .with_op("run")
                        .with_backend(backend));
                }

                Ok((
                    outcome.structured.unwrap_or(Value::Null),
                    Some(outcome.raw),
                ))
            }
            BackendRef::Provider { .. } | BackendRef::Local { .. } => {
                let value = self
                    .providers
                    .call(&tool.id, args)
                    .await
                    .map_err(|e| e.with_op("run"))?;
                Ok((value, None))
            }
        }
    }
}

/// Validate a JSON value against a schema, mapping violations to the given
/// error kind. An uncompilable schema is skipped with a warning rather than
/// failing the call; backends ship imperfect schemas routinely.
fn validate_schema(
    schema: &Value,
    instance: &Value,
    kind: ErrorKind,
    tool_id: &str,
) -> Result<(), ErrorObject> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            warn!(tool_id = %tool_id, error = %e, "uncompilable tool schema, skipping validation");
            return Ok(());
        }
    };
    if let Err(violation) = validator.validate(instance) {
        let side = match kind {
            ErrorKind::ValidationOutput => "output",
            _ => "arguments",
        };
        return Err(ErrorObject::new(
            kind,
            format!("{side} failed schema validation: {violation}"),
        )
        .with_tool(tool_id)
        .with_op("run"));
    }
    Ok(())
}

/// The chain orchestrator. Each step travels through the full dispatch chain
/// so middleware semantics (auth, rate limits, cache) apply per invocation.
pub struct ChainRunner {
    dispatcher: Arc<dyn ToolProvider>,
}

impl ChainRunner {
    pub fn new(dispatcher: Arc<dyn ToolProvider>) -> Arc<Self> {
        Arc::new(Self { dispatcher })
    }

    /// Execute steps strictly in order, stopping at the first failure while
    /// preserving every completed step result.
    pub async fn run_chain(&self, steps: &[ChainStep], template: &ToolCall) -> ChainOutcome {
        if steps.is_empty() {
            return ChainOutcome {
                results: Vec::new(),
                final_value: None,
                error: Some(ErrorObject::new(
                    ErrorKind::ValidationInput,
                    "chain requires at least one step",
                )),
            };
        }
        if steps[0].use_previous {
            return ChainOutcome {
                results: Vec::new(),
                final_value: None,
                error: Some(
                    ErrorObject::new(
                        ErrorKind::ValidationInput,
                        "first chain step cannot set use_previous",
                    )
                    .with_tool(&steps[0].tool_id),
                ),
            };
        }

        let mut results: Vec<StepResult> = Vec::with_capacity(steps.len());
        let mut previous: Option<Value> = None;
        let mut final_value: Option<Value> = None;

        for (step_index, step) in steps.iter().enumerate() {
            let mut args = step.args.clone();
            if step.use_previous
                && let Some(prev) = &previous
            {
                // Explicit args win on key collision.
                args.entry("previous").or_insert(prev.clone());
            }

            let started = Instant::now();
            let call = ToolCall::new(&step.tool_id, args)
                .with_headers(template.headers.clone())
                .with_options(template.options.clone())
                .with_cancel(template.cancel.clone());

            match self.dispatcher.handle(call).await {
                Ok(result) => {
                    previous = Some(result.value.clone());
                    final_value = Some(result.value.clone());
                    results.push(StepResult {
                        tool_id: step.tool_id.clone(),
                        value: Some(result.value),
                        error: None,
                        duration_ms: result.duration_ms,
                        tool: result.tool,
                        backend: result.backend,
                    });
                }
                Err(cause) => {
                    results.push(StepResult {
                        tool_id: step.tool_id.clone(),
                        value: None,
                        error: Some(cause.clone()),
                        duration_ms: started.elapsed().as_millis() as u64,
                        tool: None,
                        backend: None,
                    });
                    return ChainOutcome {
                        results,
                        final_value,
                        error: Some(ErrorObject::chain_step_failed(step_index, &cause)),
                    };
                }
            }
        }

        ChainOutcome {
            results,
            final_value,
            error: None,
        }
    }
}
