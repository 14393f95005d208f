// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Anomaly records and the per-sample detection rules.

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::PerformanceMetric;
use crate::config::MonitorConfig;
use crate::error::ErrorSeverity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SlowQuery,
    HighErrorRate,
    CacheMissSpike,
}

impl AnomalyKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlowQuery => "slow_query",
            Self::HighErrorRate => "high_error_rate",
            Self::CacheMissSpike => "cache_miss_spike",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub id: String,
    pub kind: AnomalyKind,
    pub severity: ErrorSeverity,
    pub query_hash: String,
    pub message: String,
    /// Observed value (ms for slow queries, a rate otherwise).
    pub value: f64,
    pub threshold: f64,
    /// Epoch millis.
    pub detected_at: u64,
}

impl Anomaly {
    fn new(kind: AnomalyKind, severity: ErrorSeverity, metric: &PerformanceMetric, message: String, value: f64, threshold: f64, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            query_hash: metric.query_hash.clone(),
            message,
            value,
            threshold,
            detected_at: now_ms,
        }
    }
}

/// `Medium` above the threshold, `High` past twice the threshold.
#[must_use]
pub fn detect_slow_query(metric: &PerformanceMetric, elapsed: Duration, config: &MonitorConfig, now_ms: u64) -> Option<Anomaly> {
    let threshold = config.slow_query_threshold();
    if elapsed <= threshold {
        return None;
    }
    let severity = if elapsed > threshold * 2 {
        ErrorSeverity::High
    } else {
        ErrorSeverity::Medium
    };
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    Some(Anomaly::new(
        AnomalyKind::SlowQuery,
        severity,
        metric,
        format!("query took {:.0} ms (threshold {} ms)", elapsed_ms, config.slow_query_threshold_ms),
        elapsed_ms,
        config.slow_query_threshold_ms as f64,
        now_ms,
    ))
}

/// Error fraction above the threshold over at least `min_samples`
/// executions. `Critical` past half, `High` past twice the threshold.
#[must_use]
pub fn detect_high_error_rate(metric: &PerformanceMetric, config: &MonitorConfig, now_ms: u64) -> Option<Anomaly> {
    let samples = metric.executions();
    if samples < config.min_samples {
        return None;
    }
    let rate = metric.errors as f64 / samples as f64;
    if rate <= config.error_rate_threshold {
        return None;
    }
    let severity = if rate > 0.5 {
        ErrorSeverity::Critical
    } else if rate > config.error_rate_threshold * 2.0 {
        ErrorSeverity::High
    } else {
        ErrorSeverity::Medium
    };
    Some(Anomaly::new(
        AnomalyKind::HighErrorRate,
        severity,
        metric,
        format!("error rate {:.1}% over {} executions", rate * 100.0, samples),
        rate,
        config.error_rate_threshold,
        now_ms,
    ))
}

/// Hit fraction below the threshold over at least `min_samples` cache
/// lookups. `High` under half the threshold.
#[must_use]
pub fn detect_cache_miss_spike(metric: &PerformanceMetric, config: &MonitorConfig, now_ms: u64) -> Option<Anomaly> {
    let samples = metric.cache_samples();
    if samples < config.min_samples {
        return None;
    }
    let hit_rate = metric.cache_hits as f64 / samples as f64;
    if hit_rate >= config.cache_hit_rate_threshold {
        return None;
    }
    let severity = if hit_rate < config.cache_hit_rate_threshold / 2.0 {
        ErrorSeverity::High
    } else {
        ErrorSeverity::Medium
    };
    Some(Anomaly::new(
        AnomalyKind::CacheMissSpike,
        severity,
        metric,
        format!("cache hit rate {:.1}% over {} lookups", hit_rate * 100.0, samples),
        hit_rate,
        config.cache_hit_rate_threshold,
        now_ms,
    ))
}
