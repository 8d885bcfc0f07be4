//! Invocation and replica metrics with Prometheus exposition
//!
//! The collector owns its own Prometheus recorder instead of installing a
//! process-global one, so several gateways (or tests) can coexist in one
//! process. Counters and histograms are lock-free on the request path; the
//! per-function invocation totals kept for the function listing live in a
//! sharded map.
//!
//! Metric names:
//! - `gateway_function_invocation_total{function_name, code}`
//! - `gateway_functions_seconds{function_name}`
//! - `gateway_service_count{function_name}`
//!
//! Invocations of names that never resolved to a function are counted under
//! [`UNKNOWN_FUNCTION`] so callers cannot create series at will.

use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const INVOCATION_TOTAL: &str = "gateway_function_invocation_total";
pub const INVOCATION_SECONDS: &str = "gateway_functions_seconds";
pub const SERVICE_COUNT: &str = "gateway_service_count";

/// `function_name` label for invocations of names that are not functions
pub const UNKNOWN_FUNCTION: &str = "<unknown>";

/// One dispatched request, as fed to the collector
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub function_name: String,
    /// Final HTTP status returned to the caller
    pub status: u16,
    pub latency: Duration,
}

pub struct GatewayMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    invocations: DashMap<String, AtomicU64>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_counter!(INVOCATION_TOTAL, "Function invocations by status code");
            describe_histogram!(INVOCATION_SECONDS, "Function invocation latency in seconds");
            describe_gauge!(SERVICE_COUNT, "Running replicas per function");
        });

        Self {
            recorder,
            handle,
            invocations: DashMap::new(),
        }
    }

    /// Record one completed dispatch
    pub fn record_invocation(&self, outcome: &InvocationOutcome) {
        let function_name = outcome.function_name.clone();
        let code = outcome.status.to_string();
        let seconds = outcome.latency.as_secs_f64();

        metrics::with_local_recorder(&self.recorder, || {
            counter!(INVOCATION_TOTAL, "function_name" => function_name.clone(), "code" => code)
                .increment(1);
            histogram!(INVOCATION_SECONDS, "function_name" => function_name).record(seconds);
        });

        if outcome.function_name == UNKNOWN_FUNCTION {
            return;
        }

        // Fast path avoids taking the shard write lock once the entry exists
        if let Some(count) = self.invocations.get(&outcome.function_name) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.invocations
            .entry(outcome.function_name.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_replica_gauge(&self, function_name: &str, count: u64) {
        let function_name = function_name.to_string();
        metrics::with_local_recorder(&self.recorder, || {
            gauge!(SERVICE_COUNT, "function_name" => function_name).set(count as f64);
        });
    }

    /// Total invocations recorded for a function
    pub fn invocation_count(&self, function_name: &str) -> u64 {
        self.invocations
            .get(function_name)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Render all metrics in the Prometheus text format
    pub fn render_exposition(&self) -> String {
        self.handle.render()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
