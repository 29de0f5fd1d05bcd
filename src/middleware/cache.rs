//! Result cache middleware.
//!
//! Keys are the SHA-256 of canonical JSON over `(tool_id, args,
//! tag_signature)`; canonical means object keys sorted recursively, so
//! argument ordering never splits the cache. Entries are immutable once
//! stored and expire by TTL. Errors are never cached, and any tool carrying
//! an unsafe tag bypasses the cache entirely. Two racing identical misses
//! may both execute the downstream; there is no single-flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{CallResult, ToolCall, ToolProvider};
use crate::index::ToolIndex;
use crate::model::Tool;
use crate::runner::RunResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default = "default_ttl", with = "crate::config::humantime_duration")]
    pub ttl: Duration,
    /// Results serialized larger than this are not stored.
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,
    /// Tools carrying any of these tags are never cached.
    #[serde(default = "default_unsafe_tags")]
    pub unsafe_tags: Vec<String>,
}

fn default_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_max_entry_bytes() -> usize {
    256 * 1024
}
fn default_unsafe_tags() -> Vec<String> {
    vec!["unsafe".to_string(), "mutating".to_string()]
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            max_entry_bytes: default_max_entry_bytes(),
            unsafe_tags: default_unsafe_tags(),
        }
    }
}

struct CacheEntry {
    value: Value,
    inserted: Instant,
}

pub struct CacheMiddleware {
    inner: Arc<dyn ToolProvider>,
    index: Arc<ToolIndex>,
    policy: CachePolicy,
    entries: DashMap<String, CacheEntry>,
}

impl CacheMiddleware {
    pub fn new(inner: Arc<dyn ToolProvider>, index: Arc<ToolIndex>, policy: CachePolicy) -> Self {
        Self {
            inner,
            index,
            policy,
            entries: DashMap::new(),
        }
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let hit = self.entries.get(key)?;
        if hit.inserted.elapsed() > self.policy.ttl {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.value.clone())
    }

    fn store(&self, key: String, value: &Value) {
        let size = serde_json::to_vec(value).map(|b| b.len()).unwrap_or(usize::MAX);
        if size > self.policy.max_entry_bytes {
            return;
        }
        self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                inserted: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl ToolProvider for CacheMiddleware {
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
        // Unknown tools fall through; the runner produces the proper error.
        let Ok((tool, backends)) = self.index.get_tool(&call.tool_id) else {
            return self.inner.handle(call).await;
        };

        if tool.tags.iter().any(|t| self.policy.unsafe_tags.contains(t)) {
            return self.inner.handle(call).await;
        }

        let key = cache_key(&call.tool_id, &call.args, &tool.tags);
        if let Some(value) = self.lookup(&key) {
            return Ok(RunResult {
                value,
                tool: call.options.include_tool.then(|| tool.clone()),
                backend: call
                    .options
                    .include_backend
                    .then(|| backends.first().cloned())
                    .flatten(),
                mcp_result: None,
                duration_ms: 0,
                cached: true,
            });
        }

        let result = self.inner.handle(call).await;
        if let Ok(run) = &result {
            self.store(key, &run.value);
        }
        result
    }
}

/// Deterministic cache key: SHA-256 over canonical JSON.
fn cache_key(tool_id: &str, args: &Map<String, Value>, tags: &[String]) -> String {
    let payload = serde_json::json!({
        "args": Value::Object(args.clone()),
        "tags": tags.join(","),
        "tool": tool_id,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&payload).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Render JSON with recursively sorted object keys.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::model::BackendRef;
    use crate::test_support::CountingProvider;

    fn indexed_tool(tags: &[&str]) -> Arc<ToolIndex> {
        let index = ToolIndex::new();
        let mut tool = Tool::new("ns", "t");
        tool.tags = crate::model::normalize_tags(tags.iter().map(|s| s.to_string()));
        index.register_tool(
            tool,
            BackendRef::Provider {
                provider_id: "p".to_string(),
            },
        );
        index
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let a: Value = serde_json::json!({"b": {"y": 1, "x": 2}, "a": [3, {"q": 1, "p": 2}]});
        let b: Value = serde_json::json!({"a": [3, {"p": 2, "q": 1}], "b": {"x": 2, "y": 1}});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_cache_key_sensitive_to_all_parts() {
        let base = cache_key("ns:t", &args(serde_json::json!({"q": 1})), &["a".into()]);
        assert_eq!(
            base,
            cache_key("ns:t", &args(serde_json::json!({"q": 1})), &["a".into()])
        );
        assert_ne!(
            base,
            cache_key("ns:u", &args(serde_json::json!({"q": 1})), &["a".into()])
        );
        assert_ne!(
            base,
            cache_key("ns:t", &args(serde_json::json!({"q": 2})), &["a".into()])
        );
        assert_ne!(
            base,
            cache_key("ns:t", &args(serde_json::json!({"q": 1})), &["b".into()])
        );
    }

    #[tokio::test]
    async fn test_hit_skips_downstream_and_marks_cached() {
        let counter = CountingProvider::ok(serde_json::json!({"n": 1}));
        let middleware = CacheMiddleware::new(
            counter.provider(),
            indexed_tool(&[]),
            CachePolicy::default(),
        );

        let first = middleware
            .handle(ToolCall::new("ns:t", args(serde_json::json!({"q": 1}))))
            .await
            .unwrap();
        assert!(!first.cached);

        let second = middleware
            .handle(ToolCall::new("ns:t", args(serde_json::json!({"q": 1}))))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.value, first.value);
        assert_eq!(counter.calls(), 1);

        // Different args miss.
        middleware
            .handle(ToolCall::new("ns:t", args(serde_json::json!({"q": 2}))))
            .await
            .unwrap();
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let counter = CountingProvider::ok(Value::Null);
        let policy = CachePolicy {
            ttl: Duration::from_millis(30),
            ..Default::default()
        };
        let middleware = CacheMiddleware::new(counter.provider(), indexed_tool(&[]), policy);

        middleware
            .handle(ToolCall::new("ns:t", Map::new()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        middleware
            .handle(ToolCall::new("ns:t", Map::new()))
            .await
            .unwrap();
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_unsafe_tag_bypasses_cache() {
        let counter = CountingProvider::ok(Value::Null);
        let middleware = CacheMiddleware::new(
            counter.provider(),
            indexed_tool(&["mutating"]),
            CachePolicy::default(),
        );

        for _ in 0..3 {
            middleware
                .handle(ToolCall::new("ns:t", Map::new()))
                .await
                .unwrap();
        }
        assert_eq!(counter.calls(), 3);
    }

    #[tokio::test]
    async fn test_errors_are_never_cached() {
        let counter = CountingProvider::err(ErrorKind::ExecutionFailed, "boom");
        let middleware = CacheMiddleware::new(
            counter.provider(),
            indexed_tool(&[]),
            CachePolicy::default(),
        );

        for _ in 0..2 {
            let _ = middleware.handle(ToolCall::new("ns:t", Map::new())).await;
        }
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_oversized_results_not_stored() {
        let big = Value::String("x".repeat(1024));
        let counter = CountingProvider::ok(big);
        let policy = CachePolicy {
            max_entry_bytes: 100,
            ..Default::default()
        };
        let middleware = CacheMiddleware::new(counter.provider(), indexed_tool(&[]), policy);

        middleware
            .handle(ToolCall::new("ns:t", Map::new()))
            .await
            .unwrap();
        middleware
            .handle(ToolCall::new("ns:t", Map::new()))
            .await
            .unwrap();
        assert_eq!(counter.calls(), 2);
    }
}
