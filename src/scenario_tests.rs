//! End-to-end scenarios over the meta-operation service with the full
//! middleware chain wired from config, mock providers standing in for
//! remote backends.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::backend::BackendManager;
use crate::config::Config;
use crate::errors::ErrorKind;
use crate::executor::ExecutorBridge;
use crate::index::ToolIndex;
use crate::meta::{DetailLevel, MetaService};
use crate::middleware::{ToolCall, build_dispatcher};
use crate::providers::ProviderRegistry;
use crate::runner::{ChainRunner, ChainStep, Runner};
use crate::skills::{SkillCatalog, SkillOverrides};
use crate::test_support::{MockProviderTool, register_mock_tool};

struct Fixture {
    meta: Arc<MetaService>,
    index: Arc<ToolIndex>,
    providers: Arc<ProviderRegistry>,
}

fn fixture(config_yaml: &str) -> Fixture {
    let config: Config = serde_yaml_ng::from_str(config_yaml).unwrap();
    config.validate().unwrap();

    let index = ToolIndex::new();
    let manager = BackendManager::new(config.refresh.clone());
    let providers = ProviderRegistry::new();
    let runner = Runner::new(
        Arc::clone(&index),
        Arc::clone(&manager),
        Arc::clone(&providers),
    );
    let (dispatcher, _metrics) =
        build_dispatcher(&config, Arc::clone(&index), runner).unwrap();
    let chains = ChainRunner::new(Arc::clone(&dispatcher));
    let skills = SkillCatalog::new(
        config.toolsets.clone(),
        config.skills.clone(),
        config.skill_limits.clone(),
    );
    let executor = ExecutorBridge::new(Vec::new(), config.executor.clone());

    let meta = Arc::new(MetaService {
        index: Arc::clone(&index),
        manager,
        dispatcher,
        chains,
        skills,
        executor,
    });
    Fixture {
        meta,
        index,
        providers,
    }
}

fn args(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

/// Scenario: search + describe round trip.
#[tokio::test]
async fn search_and_describe_round_trip() {
    let f = fixture("{}");
    register_mock_tool(
        &f.index,
        &f.providers,
        MockProviderTool::echo("ns", "a").with_description("alpha"),
    );
    register_mock_tool(
        &f.index,
        &f.providers,
        MockProviderTool::echo("ns", "b").with_description("beta"),
    );

    let search = f.meta.search_tools("alp", None, None).await.unwrap();
    let ids: Vec<&str> = search.tools.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["ns:a"]);

    let summary = f
        .meta
        .describe_tool("ns:a", DetailLevel::Summary, None)
        .await
        .unwrap();
    assert_eq!(summary.summary, "alpha");
    assert!(summary.tool.is_none());
    assert!(summary.schema_info.is_none());

    let schema = f
        .meta
        .describe_tool("ns:a", DetailLevel::Schema, None)
        .await
        .unwrap();
    assert_eq!(schema.summary, "alpha");
    assert!(schema.tool.is_some());
    assert!(schema.schema_info.is_some());
}

/// Scenario: pagination stability over three pages.
#[tokio::test]
async fn pagination_stability() {
    let f = fixture("{}");
    for name in ["a", "b", "c", "d", "e"] {
        register_mock_tool(&f.index, &f.providers, MockProviderTool::echo("ns", name));
    }

    let p1 = f.meta.search_tools("", Some(2), None).await.unwrap();
    assert_eq!(p1.tools.len(), 2);
    let c1 = p1.next_cursor.expect("cursor after page 1");

    let p2 = f
        .meta
        .search_tools("", Some(2), Some(&c1))
        .await
        .unwrap();
    assert_eq!(p2.tools.len(), 2);
    let c2 = p2.next_cursor.expect("cursor after page 2");

    let p3 = f
        .meta
        .search_tools("", Some(2), Some(&c2))
        .await
        .unwrap();
    assert_eq!(p3.tools.len(), 1);
    assert!(p3.next_cursor.is_none());

    let all: Vec<String> = p1
        .tools
        .into_iter()
        .chain(p2.tools)
        .chain(p3.tools)
        .map(|t| t.id)
        .collect();
    assert_eq!(all, vec!["ns:a", "ns:b", "ns:c", "ns:d", "ns:e"]);
}

/// Scenario: a chain stops at the failing step, preserving prior results and
/// reporting the cause trio.
#[tokio::test]
async fn chain_stops_on_error() {
    let f = fixture("{}");
    register_mock_tool(&f.index, &f.providers, MockProviderTool::echo("ns", "t1"));
    register_mock_tool(
        &f.index,
        &f.providers,
        MockProviderTool::failing("ns", "t2", "backend exploded"),
    );
    register_mock_tool(&f.index, &f.providers, MockProviderTool::echo("ns", "t3"));

    let steps = ["ns:t1", "ns:t2", "ns:t3"]
        .iter()
        .map(|id| ChainStep {
            tool_id: id.to_string(),
            args: Map::new(),
            use_previous: false,
        })
        .collect();
    let outcome = f
        .meta
        .run_chain(steps, &ToolCall::new("", Map::new()))
        .await;

    assert_eq!(outcome.results.len(), 2);
    assert!(outcome.results[0].error.is_none());
    assert_eq!(
        outcome.results[1].error.as_ref().unwrap().code,
        ErrorKind::ExecutionFailed
    );

    let error = outcome.error.unwrap();
    assert_eq!(error.code, ErrorKind::ChainStepFailed);
    assert_eq!(error.step_index, Some(1));
    assert_eq!(
        error.details.as_ref().unwrap()["cause_code"],
        "execution_failed"
    );
}

/// Scenario: rate limit trip at rate=1/s, burst=2.
#[tokio::test]
async fn rate_limit_trip() {
    let f = fixture(
        r#"
middleware:
  chain: [ratelimit]
ratelimit:
  per_tool:
    "ns:limited": {rate: 1, burst: 2}
"#,
    );
    register_mock_tool(
        &f.index,
        &f.providers,
        MockProviderTool::echo("ns", "limited"),
    );

    for _ in 0..2 {
        f.meta
            .run_tool(ToolCall::new("ns:limited", Map::new()))
            .await
            .unwrap();
    }
    let err = f
        .meta
        .run_tool(ToolCall::new("ns:limited", Map::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorKind::RateLimited);
    assert!(err.message.contains("rate limit exceeded"));
}

/// Scenario: auth required end to end — anonymous rejected, API key accepted.
#[tokio::test]
async fn auth_gate_on_full_chain() {
    let f = fixture(
        r#"
middleware:
  chain: [auth, audit, metrics, ratelimit, observe, cache, resilience]
auth:
  anonymous: false
  authenticators:
    - type: api_key
      keys:
        k-123:
          principal: svc-ci
"#,
    );
    register_mock_tool(&f.index, &f.providers, MockProviderTool::echo("ns", "t"));

    let err = f
        .meta
        .run_tool(ToolCall::new("ns:t", Map::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorKind::Unauthorized);

    let mut headers = std::collections::HashMap::new();
    headers.insert("x-api-key".to_string(), "k-123".to_string());
    let result = f
        .meta
        .run_tool(ToolCall::new("ns:t", args(serde_json::json!({"ping": 1}))).with_headers(headers))
        .await
        .unwrap();
    assert_eq!(result.value["ping"], 1);
}

/// The full default chain composes: cache marks the second identical call.
#[tokio::test]
async fn full_chain_caches_identical_calls() {
    let f = fixture("{}");
    register_mock_tool(&f.index, &f.providers, MockProviderTool::echo("ns", "t"));

    let first = f
        .meta
        .run_tool(ToolCall::new("ns:t", args(serde_json::json!({"q": 1}))))
        .await
        .unwrap();
    assert!(!first.cached);

    let second = f
        .meta
        .run_tool(ToolCall::new("ns:t", args(serde_json::json!({"q": 1}))))
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.value, first.value);
}

/// Skills plan and run through the same dispatch pipeline.
#[tokio::test]
async fn skill_plan_and_run() {
    let f = fixture(
        r#"
toolsets:
  - id: basics
    name: Basics
    tools: ["ns:first", "ns:second"]
skills:
  - id: two_step
    name: Two step
    toolset: basics
    steps:
      - id: s1
        tool_id: "ns:first"
        inputs: {seed: 7}
      - id: s2
        tool_id: "ns:second"
        use_previous: true
"#,
    );
    register_mock_tool(&f.index, &f.providers, MockProviderTool::echo("ns", "first"));
    register_mock_tool(&f.index, &f.providers, MockProviderTool::echo("ns", "second"));

    // plan(plan(s)) = plan(s)
    let plan_a = f.meta.plan_skill("two_step").unwrap();
    let plan_b = f.meta.plan_skill("two_step").unwrap();
    assert_eq!(plan_a, plan_b);

    let outcome = f
        .meta
        .run_skill(
            "two_step",
            &ToolCall::new("", Map::new()),
            &SkillOverrides::default(),
        )
        .await
        .unwrap();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.final_value.unwrap()["previous"]["seed"], 7);

    // Tighter caller override wins over the configured limit.
    let err = f
        .meta
        .run_skill(
            "two_step",
            &ToolCall::new("", Map::new()),
            &SkillOverrides {
                max_steps: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorKind::ValidationInput);
}

/// execute_code without a configured executor reports the missing
/// collaborator as a tool error.
#[tokio::test]
async fn execute_code_without_executor() {
    let f = fixture("{}");
    let err = f
        .meta
        .execute_code("python", "print(1)", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorKind::ExecutionFailed);
    assert!(err.message.contains("no code executor"));
}

/// Toolset and skill catalog surfaces.
#[tokio::test]
async fn toolset_and_skill_listing() {
    let f = fixture(
        r#"
toolsets:
  - id: web
    name: Web tools
    tools: ["ns:fetch"]
skills:
  - id: fetch_one
    name: Fetch one
    steps:
      - id: s1
        tool_id: "ns:fetch"
"#,
    );

    assert_eq!(f.meta.list_toolsets().len(), 1);
    assert_eq!(f.meta.describe_toolset("web").unwrap().tools, vec!["ns:fetch"]);
    assert!(f.meta.describe_toolset("ghost").is_err());
    assert_eq!(f.meta.list_skills().len(), 1);
    assert_eq!(f.meta.describe_skill("fetch_one").unwrap().steps.len(), 1);
}
