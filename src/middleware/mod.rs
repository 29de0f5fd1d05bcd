//! The dispatch pipeline: a composable middleware chain wrapping every tool
//! invocation.
//!
//! A `ToolProvider` exposes the stable `{name, enabled, tool, handle}`
//! surface. Middlewares are providers holding the next provider, forwarding
//! the stable methods and overriding only `handle`. `ChainBuilder::apply`
//! wraps the innermost provider first so the first-added middleware is the
//! outermost, and installs a panic guard at the boundary.

pub mod audit;
pub mod auth;
pub mod cache;
pub mod metrics;
pub mod observe;
pub mod ratelimit;
pub mod resilience;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Map;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::errors::ErrorObject;
use crate::model::{Identity, Tool};
use crate::runner::{RunOptions, RunResult};

/// One tool invocation travelling down the chain. Middlewares may enrich it
/// (auth installs the identity) before passing it inward.
#[derive(Clone)]
pub struct ToolCall {
    pub tool_id: String,
    pub args: Map<String, Value>,
    /// Transport headers copied into the request context by the server shell.
    pub headers: HashMap<String, String>,
    pub request_id: String,
    /// Installed by the auth middleware; `None` until then.
    pub identity: Option<Identity>,
    pub options: RunOptions,
    pub cancel: CancellationToken,
}

impl ToolCall {
    pub fn new(tool_id: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            tool_id: tool_id.into(),
            args,
            headers: HashMap::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            identity: None,
            options: RunOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A tool-error (`Err`) short-circuits the chain: downstream middlewares and
/// the inner handler never run.
pub type CallResult = Result<RunResult, ErrorObject>;

/// The capability surface every dispatchable provider exposes. Middlewares
/// preserve `name`/`enabled`/`tool` of the provider they wrap and override
/// only `handle`.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;
    fn enabled(&self) -> bool {
        true
    }
    fn tool(&self) -> Option<Tool> {
        None
    }
    async fn handle(&self, call: ToolCall) -> CallResult;
}

/// The innermost provider: delegates to the runner.
pub struct RunnerProvider {
    runner: Arc<crate::runner::Runner>,
}

impl RunnerProvider {
    pub fn new(runner: Arc<crate::runner::Runner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ToolProvider for RunnerProvider {
    fn name(&self) -> &str {
        "runner"
    }

    async fn handle(&self, call: ToolCall) -> CallResult {
        self.runner.run(&call).await
    }
}

/// Boundary guard: a panic anywhere in the chain is caught and mapped to an
/// `internal` tool-error; the raw detail is logged, never returned.
struct PanicGuard {
    inner: Arc<dyn ToolProvider>,
}

#[async_trait]
impl ToolProvider for PanicGuard {
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
        let tool_id = call.tool_id.clone();
        let inner = Arc::clone(&self.inner);
        match std::panic::AssertUnwindSafe(async move { inner.handle(call).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                error!(tool_id = %tool_id, panic = %detail, "panic caught in dispatch chain");
                Err(ErrorObject::internal("dispatch").with_tool(tool_id))
            }
        }
    }
}

type Layer = Box<dyn FnOnce(Arc<dyn ToolProvider>) -> Arc<dyn ToolProvider> + Send>;

/// Orders middleware around an innermost provider. Layers are applied
/// innermost-first, so the first layer added ends up outermost.
#[derive(Default)]
pub struct ChainBuilder {
    layers: Vec<Layer>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Arc<dyn ToolProvider>) -> Arc<dyn ToolProvider> + Send + 'static,
    {
        self.layers.push(Box::new(wrap));
        self
    }

    pub fn apply(self, innermost: Arc<dyn ToolProvider>) -> Arc<dyn ToolProvider> {
        let mut provider = innermost;
        for layer in self.layers.into_iter().rev() {
            provider = layer(provider);
        }
        Arc::new(PanicGuard { inner: provider })
    }
}

/// Build the configured dispatch chain around the runner. Returns the
/// dispatcher plus the metrics collector so the shell can expose snapshots.
pub fn build_dispatcher(
    config: &crate::config::Config,
    index: Arc<crate::index::ToolIndex>,
    runner: Arc<crate::runner::Runner>,
) -> anyhow::Result<(Arc<dyn ToolProvider>, Arc<metrics::MetricsCollector>)> {
    let collector = metrics::MetricsCollector::new();
    let mut builder = ChainBuilder::new();

    for name in &config.middleware.chain {
        match name.as_str() {
            "auth" => {
                let authenticators = build_authenticators(&config.auth.authenticators);
                let authorizer = build_authorizer(&config.auth.authorizer);
                let anonymous = config.auth.anonymous;
                builder = builder.layer(move |inner| {
                    Arc::new(auth::AuthMiddleware::new(
                        inner,
                        auth::CompositeAuthenticator::new(authenticators),
                        authorizer,
                        anonymous,
                    ))
                });
            }
            "audit" => {
                let include_args = config.audit.include_args;
                builder = builder.layer(move |inner| {
                    Arc::new(audit::AuditMiddleware::new(
                        inner,
                        Arc::new(audit::TracingAuditSink),
                        include_args,
                    ))
                });
            }
            "metrics" => {
                let collector = Arc::clone(&collector);
                builder = builder
                    .layer(move |inner| Arc::new(metrics::MetricsMiddleware::new(inner, collector)));
            }
            "ratelimit" => {
                let settings = config.ratelimit.clone();
                builder = builder
                    .layer(move |inner| Arc::new(ratelimit::RateLimitMiddleware::new(inner, settings)));
            }
            "observe" => {
                builder = builder.layer(|inner| Arc::new(observe::ObserveMiddleware::new(inner)));
            }
            "cache" => {
                let index = Arc::clone(&index);
                let policy = config.cache.clone();
                builder = builder
                    .layer(move |inner| Arc::new(cache::CacheMiddleware::new(inner, index, policy)));
            }
            "resilience" => {
                let retry = config.resilience.retry.clone();
                let circuit = config.resilience.circuit.clone();
                let timeout = config.resilience.timeout;
                builder = builder.layer(move |inner| {
                    Arc::new(resilience::ResilienceMiddleware::new(
                        inner, retry, circuit, timeout,
                    ))
                });
            }
            other => anyhow::bail!("unknown middleware '{other}' in chain"),
        }
    }

    let dispatcher = builder.apply(Arc::new(RunnerProvider::new(runner)));
    Ok((dispatcher, collector))
}

fn build_authenticators(
    configs: &[crate::config::AuthenticatorConfig],
) -> Vec<Arc<dyn auth::Authenticator>> {
    configs
        .iter()
        .map(|config| match config {
            crate::config::AuthenticatorConfig::Jwt { secret, issuer } => Arc::new(
                auth::JwtAuthenticator::new(secret.as_bytes(), issuer.as_deref()),
            )
                as Arc<dyn auth::Authenticator>,
            crate::config::AuthenticatorConfig::ApiKey { header, keys } => Arc::new(
                auth::ApiKeyAuthenticator::new(header.clone(), keys.clone()),
            ),
        })
        .collect()
}

fn build_authorizer(
    config: &Option<crate::config::AuthorizerConfig>,
) -> Arc<dyn auth::Authorizer> {
    match config {
        None | Some(crate::config::AuthorizerConfig::AllowAll) => Arc::new(auth::AllowAll),
        Some(crate::config::AuthorizerConfig::Rbac { roles }) => {
            Arc::new(auth::RbacAuthorizer::new(roles.clone()))
        }
    }
}
