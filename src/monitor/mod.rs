// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Performance monitor.
//!
//! Every execution is reported as an [`ExecutionSample`]. Samples are
//! aggregated per normalized-query hash into a [`PerformanceMetric`]
//! (bounded, least recently seen evicted) and checked inline for
//! anomalies. A periodic task appends [`TrendSnapshot`]s; another prunes
//! old snapshots and anomalies.
//!
//! Rate-based anomalies for a query re-fire only after another
//! `min_samples` samples, so a persistently bad query does not flood the
//! anomaly log.

pub mod anomaly;

pub use anomaly::{Anomaly, AnomalyKind};

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::MonitorConfig;
use crate::events::{EventBus, RouterEvent};
use crate::execution::DataSource;

const SLOWEST_IN_REPORT: usize = 10;

/// Timing of one execution path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub count: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
}

impl TimingStats {
    fn add(&mut self, ms: f64) {
        if self.count == 0 {
            self.min_time_ms = ms;
            self.max_time_ms = ms;
        } else {
            self.min_time_ms = self.min_time_ms.min(ms);
            self.max_time_ms = self.max_time_ms.max(ms);
        }
        self.count += 1;
        self.total_time_ms += ms;
        self.avg_time_ms = self.total_time_ms / self.count as f64;
    }
}

/// Aggregated statistics for one normalized query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetric {
    pub query_hash: String,
    pub query: String,
    pub local: TimingStats,
    pub remote: TimingStats,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    #[serde(skip)]
    error_alert_at: u64,
    #[serde(skip)]
    miss_alert_at: u64,
}

impl PerformanceMetric {
    #[must_use]
    pub fn new(query_hash: String, query: String, now_ms: u64) -> Self {
        Self {
            query_hash,
            query,
            local: TimingStats::default(),
            remote: TimingStats::default(),
            cache_hits: 0,
            cache_misses: 0,
            errors: 0,
            first_seen: now_ms,
            last_seen: now_ms,
            error_alert_at: 0,
            miss_alert_at: 0,
        }
    }

    /// Executions on either path, failed ones included.
    #[must_use]
    pub fn executions(&self) -> u64 {
        self.local.count + self.remote.count
    }

    #[must_use]
    pub fn cache_samples(&self) -> u64 {
        self.cache_hits + self.cache_misses
    }

    fn max_time_ms(&self) -> f64 {
        self.local.max_time_ms.max(self.remote.max_time_ms)
    }

    fn avg_time_ms(&self) -> f64 {
        let n = self.executions();
        if n == 0 {
            0.0
        } else {
            (self.local.total_time_ms + self.remote.total_time_ms) / n as f64
        }
    }
}

/// One observed execution.
#[derive(Debug, Clone)]
pub struct ExecutionSample {
    pub query_hash: String,
    /// Normalized query text.
    pub query: String,
    pub source: DataSource,
    pub elapsed: Duration,
    /// `None` when the execution never consulted the cache.
    pub cache_hit: Option<bool>,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSnapshot {
    pub timestamp: u64,
    pub total_executions: u64,
    pub total_errors: u64,
    pub cache_hit_rate: Option<f64>,
    pub avg_local_ms: Option<f64>,
    pub avg_remote_ms: Option<f64>,
    pub tracked_queries: usize,
    pub anomalies: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySummary {
    pub query_hash: String,
    pub query: String,
    pub executions: u64,
    pub avg_time_ms: f64,
    pub max_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at: u64,
    pub total_executions: u64,
    pub total_errors: u64,
    pub cache_hit_rate: Option<f64>,
    pub tracked_queries: usize,
    pub slowest_queries: Vec<QuerySummary>,
    pub anomaly_counts: HashMap<AnomalyKind, usize>,
    pub trend: Vec<TrendSnapshot>,
}

#[derive(Default)]
struct Tasks {
    snapshot: Option<JoinHandle<()>>,
    prune: Option<JoinHandle<()>>,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    metrics: Mutex<LruCache<String, PerformanceMetric>>,
    anomalies: Mutex<VecDeque<Anomaly>>,
    trends: Mutex<VecDeque<TrendSnapshot>>,
    total_executions: AtomicU64,
    total_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    events: Option<EventBus>,
    clock: SharedClock,
    tasks: Mutex<Tasks>,
    me: Weak<Self>,
}

impl PerformanceMonitor {
    #[must_use]
    pub fn new(config: MonitorConfig, clock: SharedClock, events: Option<EventBus>) -> Arc<Self> {
        let capacity = NonZeroUsize::new(config.metrics_capacity).unwrap_or(NonZeroUsize::MIN);
        Arc::new_cyclic(|me| Self {
            config,
            metrics: Mutex::new(LruCache::new(capacity)),
            anomalies: Mutex::new(VecDeque::new()),
            trends: Mutex::new(VecDeque::new()),
            total_executions: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            events,
            clock,
            tasks: Mutex::new(Tasks::default()),
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Aggregate one execution and return any anomalies it triggered.
    pub fn record_execution(&self, sample: ExecutionSample) -> Vec<Anomaly> {
        let now = self.clock.now_ms();
        let elapsed_ms = sample.elapsed.as_secs_f64() * 1000.0;

        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if sample.error {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        match sample.cache_hit {
            Some(true) => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            Some(false) => self.cache_misses.fetch_add(1, Ordering::Relaxed),
            None => 0,
        };

        let mut found = Vec::new();
        let tracked = {
            let mut metrics = self.metrics.lock();
            if !metrics.contains(&sample.query_hash) {
                metrics.put(
                    sample.query_hash.clone(),
                    PerformanceMetric::new(sample.query_hash.clone(), sample.query.clone(), now),
                );
            }
            if let Some(metric) = metrics.get_mut(&sample.query_hash) {
                match sample.source {
                    DataSource::Remote => metric.remote.add(elapsed_ms),
                    DataSource::Local | DataSource::Hybrid => metric.local.add(elapsed_ms),
                }
                match sample.cache_hit {
                    Some(true) => metric.cache_hits += 1,
                    Some(false) => metric.cache_misses += 1,
                    None => {}
                }
                if sample.error {
                    metric.errors += 1;
                }
                metric.last_seen = now;

                found.extend(anomaly::detect_slow_query(metric, sample.elapsed, &self.config, now));

                let executions = metric.executions();
                if executions >= metric.error_alert_at {
                    if let Some(a) = anomaly::detect_high_error_rate(metric, &self.config, now) {
                        metric.error_alert_at = executions + self.config.min_samples;
                        found.push(a);
                    }
                }
                let lookups = metric.cache_samples();
                if sample.cache_hit.is_some() && lookups >= metric.miss_alert_at {
                    if let Some(a) = anomaly::detect_cache_miss_spike(metric, &self.config, now) {
                        metric.miss_alert_at = lookups + self.config.min_samples;
                        found.push(a);
                    }
                }
            }
            metrics.len()
        };
        crate::metrics::set_tracked_queries(tracked);

        for a in &found {
            self.raise(a.clone());
        }
        found
    }

    fn raise(&self, anomaly: Anomaly) {
        warn!(
            kind = %anomaly.kind,
            severity = ?anomaly.severity,
            query_hash = %anomaly.query_hash,
            message = %anomaly.message,
            "Performance anomaly"
        );
        crate::metrics::record_anomaly(anomaly.kind.as_str(), &format!("{:?}", anomaly.severity).to_lowercase());
        if let Some(events) = &self.events {
            events.broadcast(RouterEvent::PerformanceAnomaly(anomaly.clone()));
        }
        self.anomalies.lock().push_back(anomaly);
    }

    #[must_use]
    pub fn metric(&self, query_hash: &str) -> Option<PerformanceMetric> {
        self.metrics.lock().peek(query_hash).cloned()
    }

    #[must_use]
    pub fn tracked_queries(&self) -> usize {
        self.metrics.lock().len()
    }

    /// Oldest first.
    #[must_use]
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn trends(&self) -> Vec<TrendSnapshot> {
        self.trends.lock().iter().cloned().collect()
    }

    fn global_hit_rate(&self) -> Option<f64> {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        (total > 0).then(|| hits as f64 / total as f64)
    }

    /// Append a trend snapshot of the current aggregates.
    pub fn take_snapshot(&self) -> TrendSnapshot {
        let (tracked, avg_local_ms, avg_remote_ms) = {
            let metrics = self.metrics.lock();
            let (mut local_total, mut local_n, mut remote_total, mut remote_n) = (0.0, 0u64, 0.0, 0u64);
            for (_, m) in metrics.iter() {
                local_total += m.local.total_time_ms;
                local_n += m.local.count;
                remote_total += m.remote.total_time_ms;
                remote_n += m.remote.count;
            }
            (
                metrics.len(),
                (local_n > 0).then(|| local_total / local_n as f64),
                (remote_n > 0).then(|| remote_total / remote_n as f64),
            )
        };
        let snapshot = TrendSnapshot {
            timestamp: self.clock.now_ms(),
            total_executions: self.total_executions.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            cache_hit_rate: self.global_hit_rate(),
            avg_local_ms,
            avg_remote_ms,
            tracked_queries: tracked,
            anomalies: self.anomalies.lock().len(),
        };
        self.trends.lock().push_back(snapshot.clone());
        debug!(executions = snapshot.total_executions, tracked, "Performance snapshot");
        snapshot
    }

    /// Drop trend snapshots and anomalies past their retention. Returns
    /// `(snapshots, anomalies)` removed.
    pub fn prune(&self) -> (usize, usize) {
        let now = self.clock.now_ms();
        let trend_cutoff = now.saturating_sub(self.config.trend_retention_ms);
        let anomaly_cutoff = now.saturating_sub(self.config.anomaly_retention_ms);

        let mut trends = self.trends.lock();
        let before = trends.len();
        trends.retain(|t| t.timestamp >= trend_cutoff);
        let trends_removed = before - trends.len();
        drop(trends);

        let mut anomalies = self.anomalies.lock();
        let before = anomalies.len();
        anomalies.retain(|a| a.detected_at >= anomaly_cutoff);
        let anomalies_removed = before - anomalies.len();
        drop(anomalies);

        if trends_removed + anomalies_removed > 0 {
            info!(trends_removed, anomalies_removed, "Pruned performance history");
        }
        (trends_removed, anomalies_removed)
    }

    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        let (tracked, slowest_queries) = {
            let metrics = self.metrics.lock();
            let mut all: Vec<QuerySummary> = metrics
                .iter()
                .map(|(_, m)| QuerySummary {
                    query_hash: m.query_hash.clone(),
                    query: m.query.clone(),
                    executions: m.executions(),
                    avg_time_ms: m.avg_time_ms(),
                    max_time_ms: m.max_time_ms(),
                })
                .collect();
            all.sort_by(|a, b| b.avg_time_ms.total_cmp(&a.avg_time_ms));
            all.truncate(SLOWEST_IN_REPORT);
            (metrics.len(), all)
        };

        let mut anomaly_counts = HashMap::new();
        for a in self.anomalies.lock().iter() {
            *anomaly_counts.entry(a.kind).or_insert(0) += 1;
        }

        PerformanceReport {
            generated_at: self.clock.now_ms(),
            total_executions: self.total_executions.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            cache_hit_rate: self.global_hit_rate(),
            tracked_queries: tracked,
            slowest_queries,
            anomaly_counts,
            trend: self.trends(),
        }
    }

    /// Start the snapshot and prune loops. Calling again restarts them.
    pub fn start(&self) {
        self.stop();
        let snapshot_every = Duration::from_millis(self.config.snapshot_interval_ms);
        let prune_every = Duration::from_millis(self.config.prune_interval_ms);
        let mut tasks = self.tasks.lock();
        if !snapshot_every.is_zero() {
            tasks.snapshot = Some(self.spawn_every(snapshot_every, |m| {
                m.take_snapshot();
            }));
        }
        if !prune_every.is_zero() {
            tasks.prune = Some(self.spawn_every(prune_every, |m| {
                m.prune();
            }));
        }
        info!(?snapshot_every, ?prune_every, "Performance monitor started");
    }

    pub fn stop(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.snapshot.take() {
            task.abort();
        }
        if let Some(task) = tasks.prune.take() {
            task.abort();
        }
    }

    fn spawn_every<F>(&self, every: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(&PerformanceMonitor) + Send + 'static,
    {
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                sleep(every).await;
                let Some(monitor) = me.upgrade() else {
                    return;
                };
                tick(&monitor);
            }
        })
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(task) = tasks.snapshot.take() {
            task.abort();
        }
        if let Some(task) = tasks.prune.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn monitor(clock: Arc<ManualClock>) -> Arc<PerformanceMonitor> {
        PerformanceMonitor::new(MonitorConfig::default(), clock, None)
    }

    fn sample(hash: &str, source: DataSource, ms: u64, cache_hit: Option<bool>, error: bool) -> ExecutionSample {
        ExecutionSample {
            query_hash: hash.into(),
            query: format!("select * from t{}", hash),
            source,
            elapsed: Duration::from_millis(ms),
            cache_hit,
            error,
        }
    }

    #[test]
    fn test_split_timing() {
        let monitor = monitor(Arc::new(ManualClock::new(0)));
        monitor.record_execution(sample("a", DataSource::Local, 10, Some(true), false));
        monitor.record_execution(sample("a", DataSource::Local, 30, Some(true), false));
        monitor.record_execution(sample("a", DataSource::Remote, 100, None, false));

        let m = monitor.metric("a").unwrap();
        assert_eq!(m.local.count, 2);
        assert_eq!(m.local.min_time_ms, 10.0);
        assert_eq!(m.local.max_time_ms, 30.0);
        assert_eq!(m.local.avg_time_ms, 20.0);
        assert_eq!(m.remote.count, 1);
        assert_eq!(m.cache_hits, 2);
    }

    #[test]
    fn test_slow_query_anomaly() {
        let monitor = monitor(Arc::new(ManualClock::new(0)));
        let found = monitor.record_execution(sample("a", DataSource::Remote, 6_000, None, false));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, AnomalyKind::SlowQuery);
        assert_eq!(monitor.anomalies().len(), 1);
    }

    #[test]
    fn test_cache_miss_spike_waits_for_samples() {
        let monitor = monitor(Arc::new(ManualClock::new(0)));
        for _ in 0..9 {
            let found = monitor.record_execution(sample("a", DataSource::Local, 1, Some(false), false));
            assert!(found.is_empty());
        }
        let found = monitor.record_execution(sample("a", DataSource::Local, 1, Some(false), false));
        assert_eq!(found[0].kind, AnomalyKind::CacheMissSpike);

        // Re-fires only after another batch of samples
        for _ in 0..9 {
            assert!(monitor.record_execution(sample("a", DataSource::Local, 1, Some(false), false)).is_empty());
        }
        assert_eq!(monitor.record_execution(sample("a", DataSource::Local, 1, Some(false), false)).len(), 1);
    }

    #[test]
    fn test_high_error_rate() {
        let monitor = monitor(Arc::new(ManualClock::new(0)));
        for i in 0..10 {
            monitor.record_execution(sample("a", DataSource::Remote, 1, None, i % 2 == 0));
        }
        let anomalies = monitor.anomalies();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::HighErrorRate);
    }

    #[test]
    fn test_metrics_bounded() {
        let config = MonitorConfig {
            metrics_capacity: 2,
            ..MonitorConfig::default()
        };
        let monitor = PerformanceMonitor::new(config, Arc::new(ManualClock::new(0)), None);
        for hash in ["a", "b", "c"] {
            monitor.record_execution(sample(hash, DataSource::Local, 1, None, false));
        }
        assert_eq!(monitor.tracked_queries(), 2);
        assert!(monitor.metric("a").is_none());
        assert_eq!(monitor.report().total_executions, 3);
    }

    #[test]
    fn test_snapshot_prune_and_report() {
        let clock = Arc::new(ManualClock::new(0));
        let monitor = monitor(clock.clone());
        monitor.record_execution(sample("fast", DataSource::Local, 1, Some(true), false));
        monitor.record_execution(sample("slow", DataSource::Remote, 6_000, None, false));
        monitor.take_snapshot();

        let report = monitor.report();
        assert_eq!(report.slowest_queries[0].query_hash, "slow");
        assert_eq!(report.anomaly_counts.get(&AnomalyKind::SlowQuery), Some(&1));
        assert_eq!(report.cache_hit_rate, Some(1.0));
        assert_eq!(report.trend.len(), 1);

        clock.advance(Duration::from_secs(25 * 3600));
        assert_eq!(monitor.prune(), (1, 0));
        clock.advance(Duration::from_secs(7 * 24 * 3600));
        assert_eq!(monitor.prune(), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_snapshots() {
        let monitor = monitor(Arc::new(ManualClock::new(0)));
        monitor.start();
        sleep(Duration::from_secs(185)).await;
        assert_eq!(monitor.trends().len(), 3);
        monitor.stop();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(monitor.trends().len(), 3);
    }
}
