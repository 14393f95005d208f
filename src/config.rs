// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache router.
//!
//! # Example
//!
//! ```
//! use cache_router::RouterConfig;
//!
//! // Minimal config (uses defaults)
//! let config = RouterConfig::default();
//! assert_eq!(config.max_reconnect_attempts, 10);
//! assert_eq!(config.tenant_field, "case_id");
//!
//! // Partial config from JSON
//! let config: RouterConfig = serde_json::from_str(r#"{
//!     "strict_isolation": false,
//!     "preload_tables": ["case", "contact"],
//!     "monitor": { "slow_query_threshold_ms": 2000 }
//! }"#).unwrap();
//! assert_eq!(config.monitor.slow_query_threshold_ms, 2000);
//! assert_eq!(config.monitor.min_samples, 10);
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the cache router.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Consecutive failed connects before entering degraded mode
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Reconnect backoff: `min(base * 2^(n-1), max)`
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Connect attempt timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Health probe interval while connected (0 = disabled)
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Deny table access without a tenant context that allows it
    #[serde(default = "default_strict_isolation")]
    pub strict_isolation: bool,

    /// Field injected into queries and records for tenant isolation
    #[serde(default = "default_tenant_field")]
    pub tenant_field: String,

    #[serde(default = "default_tenant_cache_namespace_prefix")]
    pub tenant_cache_namespace_prefix: String,

    /// Whole tenant switch must finish within this
    #[serde(default = "default_switch_timeout_ms")]
    pub switch_timeout_ms: u64,

    /// Tables preloaded into the cache after a tenant switch
    #[serde(default = "default_preload_tables")]
    pub preload_tables: Vec<String>,

    /// Background refresh debounce
    #[serde(default = "default_refresh_debounce_ms")]
    pub refresh_debounce_ms: u64,

    /// Max normalized queries tracked by the frequency counter
    #[serde(default = "default_frequency_capacity")]
    pub frequency_capacity: usize,

    /// Max queries tracked by the local/remote latency history
    #[serde(default = "default_latency_history_capacity")]
    pub latency_history_capacity: usize,

    /// Tenant access audit ring buffer size
    #[serde(default = "default_audit_log_capacity")]
    pub audit_log_capacity: usize,

    /// Broadcast channel buffer per subscriber
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Expired cache sweep interval (0 = disabled)
    #[serde(default = "default_cache_cleanup_interval_ms")]
    pub cache_cleanup_interval_ms: u64,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_reconnect_base_delay_ms() -> u64 { 1_000 }
fn default_reconnect_max_delay_ms() -> u64 { 30_000 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_health_check_interval_ms() -> u64 { 30_000 }
fn default_strict_isolation() -> bool { true }
fn default_tenant_field() -> String { "case_id".into() }
fn default_tenant_cache_namespace_prefix() -> String { "tenant".into() }
fn default_switch_timeout_ms() -> u64 { 30_000 }
fn default_preload_tables() -> Vec<String> { vec!["case".into(), "claim".into(), "document".into()] }
fn default_refresh_debounce_ms() -> u64 { 100 }
fn default_frequency_capacity() -> usize { 10_000 }
fn default_latency_history_capacity() -> usize { 10_000 }
fn default_audit_log_capacity() -> usize { 10_000 }
fn default_event_channel_capacity() -> usize { 256 }
fn default_cache_cleanup_interval_ms() -> u64 { 5 * 60 * 1000 } // 5 min

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            strict_isolation: default_strict_isolation(),
            tenant_field: default_tenant_field(),
            tenant_cache_namespace_prefix: default_tenant_cache_namespace_prefix(),
            switch_timeout_ms: default_switch_timeout_ms(),
            preload_tables: default_preload_tables(),
            refresh_debounce_ms: default_refresh_debounce_ms(),
            frequency_capacity: default_frequency_capacity(),
            latency_history_capacity: default_latency_history_capacity(),
            audit_log_capacity: default_audit_log_capacity(),
            event_channel_capacity: default_event_channel_capacity(),
            cache_cleanup_interval_ms: default_cache_cleanup_interval_ms(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }

    #[must_use]
    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

/// Performance monitor thresholds and housekeeping.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Executions slower than this are `SlowQuery` anomalies
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,

    /// Error fraction above which `HighErrorRate` fires
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Hit fraction below which `CacheMissSpike` fires
    #[serde(default = "default_cache_hit_rate_threshold")]
    pub cache_hit_rate_threshold: f64,

    /// Samples needed before rate-based anomalies are evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    /// Max tracked query hashes (LRU evicted)
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,

    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    #[serde(default = "default_trend_retention_ms")]
    pub trend_retention_ms: u64,
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,
    #[serde(default = "default_anomaly_retention_ms")]
    pub anomaly_retention_ms: u64,
}

fn default_slow_query_threshold_ms() -> u64 { 5_000 }
fn default_error_rate_threshold() -> f64 { 0.1 }
fn default_cache_hit_rate_threshold() -> f64 { 0.7 }
fn default_min_samples() -> u64 { 10 }
fn default_metrics_capacity() -> usize { 10_000 }
fn default_snapshot_interval_ms() -> u64 { 60 * 1000 } // 1 min
fn default_trend_retention_ms() -> u64 { 24 * 60 * 60 * 1000 } // 24 h
fn default_prune_interval_ms() -> u64 { 60 * 60 * 1000 } // 1 h
fn default_anomaly_retention_ms() -> u64 { 7 * 24 * 60 * 60 * 1000 } // 7 days

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            error_rate_threshold: default_error_rate_threshold(),
            cache_hit_rate_threshold: default_cache_hit_rate_threshold(),
            min_samples: default_min_samples(),
            metrics_capacity: default_metrics_capacity(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            trend_retention_ms: default_trend_retention_ms(),
            prune_interval_ms: default_prune_interval_ms(),
            anomaly_retention_ms: default_anomaly_retention_ms(),
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }
}
