//! Resilience middleware: optional retry with exponential backoff, an
//! optional per-tool circuit breaker, and an optional overall deadline.
//!
//! Retries fire only for errors the mapper marked `retryable`. The deadline
//! composes with the caller's cancellation: whichever is stricter wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CallResult, ToolCall, ToolProvider};
use crate::errors::{ErrorKind, ErrorObject};
use crate::model::Tool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay", with = "crate::config::humantime_duration")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", with = "crate::config::humantime_duration")]
    pub max_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        self.initial_delay.mul_f64(multiplier).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitPolicy {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects before allowing a half-open probe.
    #[serde(default = "default_open_cooldown", with = "crate::config::humantime_duration")]
    pub open_cooldown: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_cooldown() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_cooldown: default_open_cooldown(),
        }
    }
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct ResilienceMiddleware {
    inner: Arc<dyn ToolProvider>,
    retry: Option<RetryPolicy>,
    circuit: Option<CircuitPolicy>,
    timeout: Option<Duration>,
    breakers: DashMap<String, std::sync::Mutex<BreakerState>>,
}

impl ResilienceMiddleware {
    pub fn new(
        inner: Arc<dyn ToolProvider>,
        retry: Option<RetryPolicy>,
        circuit: Option<CircuitPolicy>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            retry,
            circuit,
            timeout,
            breakers: DashMap::new(),
        }
    }

    /// Reject immediately when the tool's circuit is open and still cooling
    /// down. After the cooldown one probe goes through (half-open).
    fn check_circuit(&self, tool_id: &str) -> Result<(), ErrorObject> {
        let Some(policy) = &self.circuit else {
            return Ok(());
        };
        let Some(entry) = self.breakers.get(tool_id) else {
            return Ok(());
        };
        let state = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() < policy.open_cooldown {
                return Err(ErrorObject::new(
                    ErrorKind::BackendUnavailable,
                    format!("circuit open for '{tool_id}'"),
                )
                .with_tool(tool_id)
                .with_op("resilience"));
            }
            debug!(tool_id = %tool_id, "circuit half-open, allowing probe");
        }
        Ok(())
    }

    fn record_outcome(&self, tool_id: &str, success: bool) {
        let Some(policy) = &self.circuit else {
            return;
        };
        let entry = self
            .breakers
            .entry(tool_id.to_string())
            .or_default();
        let mut state = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        if success {
            state.consecutive_failures = 0;
            state.opened_at = None;
        } else {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= policy.failure_threshold {
                if state.opened_at.is_none() {
                    warn!(
                        tool_id = %tool_id,
                        failures = state.consecutive_failures,
                        "circuit breaker tripped"
                    );
                }
                state.opened_at = Some(Instant::now());
            }
        }
    }

    async fn attempt(&self, call: ToolCall) -> CallResult {
        let tool_id = call.tool_id.clone();
        match self.timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.inner.handle(call)).await {
                    Ok(result) => result,
                    Err(_) => Err(ErrorObject::new(
                        ErrorKind::Timeout,
                        format!("deadline exceeded after {deadline:?}"),
                    )
                    .with_tool(tool_id)
                    .with_op("resilience")),
                }
            }
            None => self.inner.handle(call).await,
        }
    }
}

#[async_trait]
impl ToolProvider for ResilienceMiddleware {
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
        self.check_circuit(&call.tool_id)?;

        let max_retries = self.retry.as_ref().map(|r| r.max_retries).unwrap_or(0);
        let mut attempt = 0u32;
        loop {
            let result = self.attempt(call.clone()).await;
            self.record_outcome(&call.tool_id, result.is_ok());

            match result {
                Ok(run) => return Ok(run),
                Err(err) => {
                    if !err.retryable || attempt >= max_retries {
                        return Err(err);
                    }
                    let delay = self
                        .retry
                        .as_ref()
                        .map(|r| r.delay_for(attempt))
                        .unwrap_or_default();
                    debug!(
                        tool_id = %call.tool_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        code = err.code.code(),
                        "retrying after retryable error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
