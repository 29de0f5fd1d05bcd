//! Token-bucket rate limiting. Bucket resolution order: tool-specific
//! bucket, then per-identity (when enabled and the caller is not anonymous),
//! then the anonymous fallback, else the global bucket. Exhaustion yields a
//! tool-error immediately; there is no blocking wait.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};

use super::{CallResult, ToolCall, ToolProvider};
use crate::errors::{ErrorKind, ErrorObject};
use crate::model::Tool;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Refill rate (tokens per second) and burst capacity of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSpec {
    pub rate: u32,
    pub burst: u32,
}

impl RateSpec {
    fn quota(&self) -> Quota {
        let rate = NonZeroU32::new(self.rate.max(1)).expect("nonzero rate");
        let burst = NonZeroU32::new(self.burst.max(1)).expect("nonzero burst");
        Quota::per_second(rate).allow_burst(burst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// The global fallback bucket.
    #[serde(default = "default_global")]
    pub global: RateSpec,
    /// Tool-specific buckets keyed by tool id; matched first.
    #[serde(default)]
    pub per_tool: HashMap<String, RateSpec>,
    /// Give each non-anonymous principal its own bucket.
    #[serde(default)]
    pub per_identity: bool,
    /// Bucket spec for per-identity buckets; global spec when absent.
    #[serde(default)]
    pub identity_rate: Option<RateSpec>,
    /// Shared fallback bucket for anonymous callers.
    #[serde(default)]
    pub anonymous_rate: Option<RateSpec>,
}

fn default_global() -> RateSpec {
    RateSpec {
        rate: 50,
        burst: 100,
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global: default_global(),
            per_tool: HashMap::new(),
            per_identity: false,
            identity_rate: None,
            anonymous_rate: None,
        }
    }
}

pub struct RateLimitMiddleware {
    inner: Arc<dyn ToolProvider>,
    settings: RateLimitSettings,
    /// Lazily created buckets; DashMap's entry API gives the
    /// double-checked creation discipline.
    buckets: DashMap<String, Arc<Bucket>>,
}

impl RateLimitMiddleware {
    pub fn new(inner: Arc<dyn ToolProvider>, settings: RateLimitSettings) -> Self {
        Self {
            inner,
            settings,
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, key: &str, spec: RateSpec) -> Arc<Bucket> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::direct(spec.quota())))
            .clone()
    }

    /// Pick the bucket for a call: tool-specific, identity, anonymous
    /// fallback, global.
    fn resolve(&self, call: &ToolCall) -> (String, RateSpec) {
        if let Some(spec) = self.settings.per_tool.get(&call.tool_id) {
            return (format!("tool:{}", call.tool_id), *spec);
        }
        let anonymous = call.identity.as_ref().is_none_or(|id| id.is_anonymous());
        if self.settings.per_identity && !anonymous {
            let principal = &call.identity.as_ref().expect("non-anonymous").principal;
            let spec = self.settings.identity_rate.unwrap_or(self.settings.global);
            return (format!("identity:{principal}"), spec);
        }
        if anonymous && let Some(spec) = self.settings.anonymous_rate {
            return ("anonymous".to_string(), spec);
        }
        ("global".to_string(), self.settings.global)
    }
}

#[async_trait]
impl ToolProvider for RateLimitMiddleware {
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
        let (key, spec) = self.resolve(&call);
        if self.bucket(&key, spec).check().is_err() {
            return Err(ErrorObject::new(
                ErrorKind::RateLimited,
                format!("rate limit exceeded for {key}"),
            )
            .with_tool(&call.tool_id)
            .with_op("ratelimit"));
        }
        self.inner.handle(call).await
    }
}
