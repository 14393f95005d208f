// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cache-router.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cache_router_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `source`: local, remote, hybrid
//! - `strategy`: LOCAL_FIRST, REMOTE_FIRST, LOCAL_ONLY, REMOTE_ONLY, HYBRID
//! - `category`: error taxonomy (connection, query, cache, ...)
//! - `anomaly`: slow_query, high_error_rate, cache_miss_spike

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record one executed query
pub fn record_execution(source: &str, strategy: &str, duration: Duration) {
    counter!(
        "cache_router_queries_total",
        "source" => source.to_string(),
        "strategy" => strategy.to_string()
    )
    .increment(1);
    histogram!(
        "cache_router_query_seconds",
        "source" => source.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a query served from cached local data
pub fn record_cache_hit(table: &str) {
    counter!("cache_router_cache_hits_total", "table" => table.to_string()).increment(1);
}

/// Record a query whose local path had nothing usable
pub fn record_cache_miss(table: &str) {
    counter!("cache_router_cache_misses_total", "table" => table.to_string()).increment(1);
}

/// Record a step in the attempt plan that failed over to the next one
pub fn record_fallback(from: &str, to: &str) {
    counter!(
        "cache_router_fallbacks_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record cache entries dropped after a write or a change notification
pub fn record_invalidation(reason: &str, count: usize) {
    counter!("cache_router_invalidations_total", "reason" => reason.to_string()).increment(count as u64);
}

/// Record a background refresh outcome (`success`, `error`, `debounced`)
pub fn record_background_refresh(outcome: &str) {
    counter!("cache_router_background_refresh_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record an error by taxonomy category
pub fn record_error(category: &str) {
    counter!("cache_router_errors_total", "category" => category.to_string()).increment(1);
}

/// Set connection phase (for monitoring state machine transitions)
pub fn set_connection_state(phase: &str, connected: bool) {
    counter!(
        "cache_router_connection_transitions_total",
        "phase" => phase.to_string()
    )
    .increment(1);
    gauge!("cache_router_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a reconnection attempt
pub fn record_reconnect_attempt(attempt: u32, delay: Duration) {
    counter!("cache_router_reconnect_attempts_total").increment(1);
    gauge!("cache_router_reconnect_attempt").set(f64::from(attempt));
    histogram!("cache_router_reconnect_delay_seconds").record(delay.as_secs_f64());
}

/// Record a finished tenant switch (`success`, `failure`, `cancelled`, `rejected`)
pub fn record_tenant_switch(outcome: &str, duration: Duration) {
    counter!("cache_router_tenant_switches_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("cache_router_tenant_switch_seconds").record(duration.as_secs_f64());
}

/// Record a tenant access denied by strict isolation
pub fn record_access_denied(table: &str) {
    counter!("cache_router_access_denied_total", "table" => table.to_string()).increment(1);
}

/// Record a detected performance anomaly
pub fn record_anomaly(kind: &str, severity: &str) {
    counter!(
        "cache_router_anomalies_total",
        "anomaly" => kind.to_string(),
        "severity" => severity.to_string()
    )
    .increment(1);
}

/// Set number of queries tracked by the performance monitor
pub fn set_tracked_queries(count: usize) {
    gauge!("cache_router_tracked_queries").set(count as f64);
}

/// Set number of live table subscriptions
pub fn set_live_subscriptions(count: usize) {
    gauge!("cache_router_live_subscriptions").set(count as f64);
}

/// Record an operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "cache_router_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    // Without an installed recorder these verify the API doesn't panic.

    #[test]
    fn test_record_execution() {
        record_execution("local", "LOCAL_FIRST", Duration::from_micros(300));
        record_execution("remote", "REMOTE_ONLY", Duration::from_millis(40));
        record_execution("hybrid", "HYBRID", Duration::from_millis(2));
    }

    #[test]
    fn test_cache_and_fallback_counters() {
        record_cache_hit("user");
        record_cache_miss("claim");
        record_fallback("local", "remote");
        record_invalidation("write", 3);
        record_background_refresh("success");
    }

    #[test]
    fn test_connection_metrics() {
        set_connection_state("connecting", false);
        set_connection_state("connected", true);
        record_reconnect_attempt(2, Duration::from_secs(2));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("switch_step");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }

    #[test]
    fn test_error_counter_with_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_error("timeout");
            record_error("timeout");
            record_anomaly("slow_query", "medium");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let errors = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "cache_router_errors_total")
            .map(|(_, _, _, value)| value.clone());
        assert_eq!(errors, Some(&DebugValue::Counter(2)));
        assert!(snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "cache_router_anomalies_total"));
    }
}
