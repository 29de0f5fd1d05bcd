//! Per-tool invocation metrics: counters, in-flight gauge and latency
//! percentiles. The collector is process-local and concurrency-safe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;

use super::{CallResult, ToolCall, ToolProvider};
use crate::model::Tool;

#[derive(Default)]
struct ToolCounters {
    total: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
    in_flight: AtomicU64,
    last_duration_us: AtomicU64,
}

/// Snapshot of one tool's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ToolMetrics {
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub in_flight: u64,
    pub last_duration_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
}

pub struct MetricsCollector {
    counters: DashMap<String, Arc<ToolCounters>>,
    /// Inner Mutex because `Histogram::record` takes `&mut self`.
    latency: DashMap<String, Mutex<Histogram<u64>>>,
}

impl MetricsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: DashMap::new(),
            latency: DashMap::new(),
        })
    }

    fn counters(&self, tool_id: &str) -> Arc<ToolCounters> {
        self.counters
            .entry(tool_id.to_string())
            .or_default()
            .clone()
    }

    fn begin(&self, tool_id: &str) -> InFlightGuard {
        let counters = self.counters(tool_id);
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(counters)
    }

    fn record(&self, tool_id: &str, duration: Duration, success: bool) {
        let counters = self.counters(tool_id);
        counters.total.fetch_add(1, Ordering::SeqCst);
        if success {
            counters.success.fetch_add(1, Ordering::SeqCst);
        } else {
            counters.error.fetch_add(1, Ordering::SeqCst);
        }
        let duration_us = (duration.as_micros() as u64).max(1);
        counters.last_duration_us.store(duration_us, Ordering::SeqCst);

        self.latency
            .entry(tool_id.to_string())
            .or_insert_with(|| {
                // 1µs to 10 minutes at 3 significant digits.
                Mutex::new(
                    Histogram::<u64>::new_with_bounds(1, 600_000_000, 3)
                        .expect("valid histogram bounds"),
                )
            })
            .value()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(duration_us)
            .ok(); // out-of-range samples are dropped
    }

    pub fn snapshot(&self, tool_id: &str) -> Option<ToolMetrics> {
        let counters = self.counters.get(tool_id)?;
        let (p50, p99) = self
            .latency
            .get(tool_id)
            .map(|h| {
                let hist = h.value().lock().unwrap_or_else(|e| e.into_inner());
                (
                    hist.value_at_quantile(0.5) as f64 / 1000.0,
                    hist.value_at_quantile(0.99) as f64 / 1000.0,
                )
            })
            .unwrap_or((0.0, 0.0));
        Some(ToolMetrics {
            total: counters.total.load(Ordering::SeqCst),
            success: counters.success.load(Ordering::SeqCst),
            error: counters.error.load(Ordering::SeqCst),
            in_flight: counters.in_flight.load(Ordering::SeqCst),
            last_duration_ms: counters.last_duration_us.load(Ordering::SeqCst) as f64 / 1000.0,
            p50_ms: p50,
            p99_ms: p99,
        })
    }
}

struct InFlightGuard(Arc<ToolCounters>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MetricsMiddleware {
    inner: Arc<dyn ToolProvider>,
    collector: Arc<MetricsCollector>,
}

impl MetricsMiddleware {
    pub fn new(inner: Arc<dyn ToolProvider>, collector: Arc<MetricsCollector>) -> Self {
        Self { inner, collector }
    }
}

#[async_trait]
impl ToolProvider for MetricsMiddleware {
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
        let _guard = self.collector.begin(&tool_id);
        let started = Instant::now();

        let result = self.inner.handle(call).await;

        self.collector
            .record(&tool_id, started.elapsed(), result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::test_support::FixedProvider;
    use serde_json::{Map, Value};

    #[tokio::test]
    async fn test_counters_track_success_and_error() {
        let collector = MetricsCollector::new();
        let ok = MetricsMiddleware::new(FixedProvider::ok(Value::Null), Arc::clone(&collector));
        let failing = MetricsMiddleware::new(
            FixedProvider::err(ErrorKind::ExecutionFailed, "nope"),
            Arc::clone(&collector),
        );

        ok.handle(ToolCall::new("ns:t", Map::new())).await.unwrap();
        ok.handle(ToolCall::new("ns:t", Map::new())).await.unwrap();
        let _ = failing.handle(ToolCall::new("ns:t", Map::new())).await;

        let metrics = collector.snapshot("ns:t").unwrap();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.success, 2);
        assert_eq!(metrics.error, 1);
        assert_eq!(metrics.in_flight, 0);
        assert!(metrics.last_duration_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_unknown_tool_has_no_snapshot() {
        let collector = MetricsCollector::new();
        assert!(collector.snapshot("ns:never").is_none());
    }

    #[tokio::test]
    async fn test_in_flight_gauge_during_call() {
        let collector = MetricsCollector::new();
        let guard = collector.begin("ns:t");
        assert_eq!(collector.snapshot("ns:t").unwrap().in_flight, 1);
        drop(guard);
        assert_eq!(collector.snapshot("ns:t").unwrap().in_flight, 0);
    }
}
