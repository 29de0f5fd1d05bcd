//! Observe middleware: a tracing span plus structured events around each
//! dispatch.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, debug, info_span, warn};

use super::{CallResult, ToolCall, ToolProvider};
use crate::model::Tool;

pub struct ObserveMiddleware {
    inner: Arc<dyn ToolProvider>,
}

impl ObserveMiddleware {
    pub fn new(inner: Arc<dyn ToolProvider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ToolProvider for ObserveMiddleware {
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
        let span = info_span!(
            "tool_call",
            tool_id = %call.tool_id,
            request_id = %call.request_id,
        );
        let inner = Arc::clone(&self.inner);
        async move {
            let started = Instant::now();
            debug!("dispatching");
            let result = inner.handle(call).await;
            match &result {
                Ok(run) => debug!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    cached = run.cached,
                    "dispatch complete"
                ),
                Err(e) => warn!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    code = e.code.code(),
                    retryable = e.retryable,
                    "dispatch failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }
}
