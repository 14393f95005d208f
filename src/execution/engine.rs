// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The cache execution engine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::freshness::{age_of, hybrid_freshness_score, Freshness, LatencyHistory, Path};
use super::plan::{plan_for, Attempt, AttemptLog, AttemptPlan, Exhausted, StepOutcome};
use super::refresh::BackgroundRefresher;
use super::{DataSource, ExecutionResult};
use crate::clock::SharedClock;
use crate::config::RouterConfig;
use crate::error::{ErrorTracker, Result, RouterError};
use crate::events::{EventBus, RouterEvent};
use crate::monitor::{ExecutionSample, PerformanceMonitor};
use crate::policy::{CacheRoutingDecision, CacheStrategy, StrategyDecider, TablePolicyRegistry};
use crate::query::analyzer::normalize_query;
use crate::query::{QueryAnalysis, QueryAnalyzer};
use crate::resilience::connection::ConnectionState;
use crate::storage::{CacheKey, CacheType, CachedData, LocalStore, Params, RemoteService};
use crate::subscription::{ChangeAction, ChangeNotification, LiveQueryManager};
use crate::tenant::TenantContext;

/// Entries above this TTL are stored as persistent.
const PERSISTENT_TTL: Duration = Duration::from_secs(3600);

/// TTL for preloaded tables without a profile.
const DEFAULT_PRELOAD_TTL: Duration = Duration::from_secs(30 * 60);

/// User and case a query runs for.
#[derive(Debug, Clone, Copy, Default)]
struct Scope<'a> {
    user_id: Option<&'a str>,
    case_id: Option<&'a str>,
    tenant: Option<&'a TenantContext>,
}

/// Cached entries for every table a query references.
struct CacheLookup {
    /// Worst bucket across the tables.
    freshness: Freshness,
}

struct Served {
    data: Vec<Value>,
    source: DataSource,
    cache_hit: bool,
}

pub struct CacheExecutionEngine {
    analyzer: Arc<QueryAnalyzer>,
    decider: StrategyDecider,
    remote: Arc<dyn RemoteService>,
    local: Arc<dyn LocalStore>,
    connection: watch::Receiver<ConnectionState>,
    events: EventBus,
    clock: SharedClock,
    latency: LatencyHistory,
    refresher: BackgroundRefresher,
    errors: Arc<ErrorTracker>,
    monitor: Option<Arc<PerformanceMonitor>>,
    live: Option<Arc<LiveQueryManager>>,
    tenant_field: String,
}

impl CacheExecutionEngine {
    /// Engine that assumes the remote is reachable until
    /// [`with_connection`](Self::with_connection) supplies real state.
    #[must_use]
    pub fn new(
        registry: Arc<TablePolicyRegistry>,
        remote: Arc<dyn RemoteService>,
        local: Arc<dyn LocalStore>,
        config: &RouterConfig,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        let (_tx, connection) = watch::channel(ConnectionState::connected());
        Self {
            analyzer: Arc::new(QueryAnalyzer::new(config.frequency_capacity)),
            decider: StrategyDecider::new(registry),
            remote,
            local,
            connection,
            events,
            clock,
            latency: LatencyHistory::new(config.latency_history_capacity),
            refresher: BackgroundRefresher::new(config.refresh_debounce()),
            errors: Arc::new(ErrorTracker::new()),
            monitor: None,
            live: None,
            tenant_field: config.tenant_field.clone(),
        }
    }

    #[must_use]
    pub fn with_connection(mut self, connection: watch::Receiver<ConnectionState>) -> Self {
        self.connection = connection;
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn with_live_queries(mut self, live: Arc<LiveQueryManager>) -> Self {
        self.live = Some(live);
        self
    }

    #[must_use]
    pub fn with_error_tracker(mut self, errors: Arc<ErrorTracker>) -> Self {
        self.errors = errors;
        self
    }

    #[must_use]
    pub fn analyzer(&self) -> &Arc<QueryAnalyzer> {
        &self.analyzer
    }

    #[must_use]
    pub fn decider(&self) -> &StrategyDecider {
        &self.decider
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TablePolicyRegistry> {
        self.decider.registry()
    }

    #[must_use]
    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.remote
    }

    #[must_use]
    pub fn latency(&self) -> &LatencyHistory {
        &self.latency
    }

    #[must_use]
    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    #[must_use]
    pub fn monitor(&self) -> Option<&Arc<PerformanceMonitor>> {
        self.monitor.as_ref()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.borrow().is_connected
    }

    /// Route and run a query for a user/case scope.
    #[instrument(skip(self, params))]
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &Params,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> Result<ExecutionResult> {
        self.execute(sql, params, Scope { user_id, case_id, tenant: None }).await
    }

    /// Route and run a query scoped to a tenant's user and case.
    #[instrument(skip(self, params, tenant), fields(tenant_id = %tenant.tenant_id))]
    pub async fn execute_for_tenant(&self, sql: &str, params: &Params, tenant: &TenantContext) -> Result<ExecutionResult> {
        let scope = Scope {
            user_id: tenant.user_id.as_deref(),
            case_id: Some(tenant.cache_case()),
            tenant: Some(tenant),
        };
        self.execute(sql, params, scope).await
    }

    async fn execute(&self, sql: &str, params: &Params, scope: Scope<'_>) -> Result<ExecutionResult> {
        let started = Instant::now();
        let analysis = self.analyzer.analyze(sql, Some(params));
        let decision = self.decider.decide_cache_strategy(&analysis, scope.user_id, scope.tenant);

        let resolved = match decision.strategy {
            CacheStrategy::Hybrid => self.resolve_hybrid(&analysis, scope).await,
            strategy => strategy,
        };
        let plan = plan_for(resolved);

        let outcome = self.run_plan(&plan, sql, params, &analysis, &decision, scope).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok((served, log)) => {
                let consulted = log.entries().iter().any(|(a, _)| matches!(a, Attempt::Local { .. }));
                let cache_hit = if served.cache_hit {
                    Some(true)
                } else if consulted {
                    Some(false)
                } else {
                    None
                };
                self.report(&analysis, sql, served.source, decision.strategy, elapsed, cache_hit, false);

                if analysis.query_type.is_write() {
                    self.after_write(&analysis, scope).await;
                } else if decision.enable_live_query {
                    self.start_live_queries(&analysis, scope);
                }

                debug!(
                    strategy = %decision.strategy,
                    resolved = %resolved,
                    source = %served.source,
                    rows = served.data.len(),
                    ?elapsed,
                    "Query executed"
                );
                Ok(ExecutionResult {
                    data: served.data,
                    source: served.source,
                    execution_time: elapsed,
                    cache_hit: served.cache_hit,
                    strategy: decision.strategy,
                })
            }
            Err(e) => {
                let source = if plan.steps.contains(&Attempt::Remote) {
                    DataSource::Remote
                } else {
                    DataSource::Local
                };
                self.report(&analysis, sql, source, decision.strategy, elapsed, None, true);
                self.errors.record(e.category());
                warn!(strategy = %decision.strategy, error = %e, "Query failed");
                Err(e)
            }
        }
    }

    async fn run_plan(
        &self,
        plan: &AttemptPlan,
        sql: &str,
        params: &Params,
        analysis: &QueryAnalysis,
        decision: &CacheRoutingDecision,
        scope: Scope<'_>,
    ) -> Result<(Served, AttemptLog)> {
        let mut log = AttemptLog::default();

        for (i, step) in plan.steps.iter().enumerate() {
            let outcome = match step {
                Attempt::Local { accept_empty } => {
                    match self.try_local(sql, params, analysis, decision, scope, *accept_empty).await {
                        Ok(served) => return Ok((served, log)),
                        Err(outcome) => outcome,
                    }
                }
                Attempt::Remote => match self.try_remote(sql, params, analysis, decision, scope).await {
                    Ok(served) => return Ok((served, log)),
                    Err(outcome) => outcome,
                },
            };
            if let Some(next) = plan.steps.get(i + 1) {
                crate::metrics::record_fallback(step.label(), next.label());
                debug!(from = step.label(), to = next.label(), outcome = ?outcome, "Falling back");
            }
            log.push(*step, outcome);
        }

        match plan.on_exhausted {
            Exhausted::Empty => Ok((
                Served {
                    data: Vec::new(),
                    source: DataSource::Local,
                    cache_hit: false,
                },
                log,
            )),
            Exhausted::Fail => Err(log
                .first_remote_error()
                .or_else(|| log.first_error())
                .cloned()
                .unwrap_or(RouterError::NotConnected)),
        }
    }

    async fn try_local(
        &self,
        sql: &str,
        params: &Params,
        analysis: &QueryAnalysis,
        decision: &CacheRoutingDecision,
        scope: Scope<'_>,
        accept_empty: bool,
    ) -> std::result::Result<Served, StepOutcome> {
        let lookup = match self.lookup_cache(&analysis.tables, scope).await {
            Ok(Some(lookup)) => lookup,
            Ok(None) => {
                if let Some(table) = analysis.tables.first() {
                    crate::metrics::record_cache_miss(table);
                }
                return Err(StepOutcome::CacheMiss);
            }
            Err(e) => return Err(StepOutcome::Failed(e)),
        };

        let started = Instant::now();
        let rows = match self.local.query(sql, params).await {
            Ok(sets) => flatten(sets),
            Err(e) => return Err(StepOutcome::Failed(e.into())),
        };
        self.latency.record(&analysis.query_hash, Path::Local, started.elapsed());

        if rows.is_empty() && !accept_empty {
            return Err(StepOutcome::Empty);
        }
        if let Some(table) = analysis.tables.first() {
            crate::metrics::record_cache_hit(table);
        }

        let refreshing = lookup.freshness == Freshness::Stale
            && self.schedule_refresh(sql, params, analysis, decision, scope);
        Ok(Served {
            data: rows,
            source: if refreshing { DataSource::Hybrid } else { DataSource::Local },
            cache_hit: true,
        })
    }

    async fn try_remote(
        &self,
        sql: &str,
        params: &Params,
        analysis: &QueryAnalysis,
        decision: &CacheRoutingDecision,
        scope: Scope<'_>,
    ) -> std::result::Result<Served, StepOutcome> {
        if !self.is_connected() {
            return Err(StepOutcome::Failed(RouterError::NotConnected));
        }

        let started = Instant::now();
        let rows = match self.remote.query(sql, params).await {
            Ok(sets) => flatten(sets),
            Err(e) => return Err(StepOutcome::Failed(e.into())),
        };
        self.latency.record(&analysis.query_hash, Path::Remote, started.elapsed());

        if analysis.is_read() && decision.is_cacheable() {
            let populated = populate_cache(
                self.local.as_ref(),
                &self.clock,
                self.registry(),
                &analysis.tables,
                &rows,
                decision.cache_ttl,
                scope.user_id,
                scope.case_id,
            )
            .await;
            if let Err(e) = populated {
                warn!(error = %e, "Failed to cache remote result");
            }
        }

        Ok(Served {
            data: rows,
            source: DataSource::Remote,
            cache_hit: false,
        })
    }

    /// `None` unless every referenced table has a cache entry in scope.
    async fn lookup_cache(&self, tables: &[String], scope: Scope<'_>) -> Result<Option<CacheLookup>> {
        if tables.is_empty() {
            return Ok(None);
        }
        let now = self.clock.now_ms();
        let mut freshness = Freshness::High;
        for table in tables {
            let key = CacheKey::new(table.as_str(), scope.user_id, scope.case_id);
            match self.local.get_cache(&key).await? {
                Some(entry) => freshness = freshness.max(Freshness::of(&entry, now)),
                None => return Ok(None),
            }
        }
        Ok(Some(CacheLookup { freshness }))
    }

    async fn resolve_hybrid(&self, analysis: &QueryAnalysis, scope: Scope<'_>) -> CacheStrategy {
        let now = self.clock.now_ms();
        let mut ages = Vec::with_capacity(analysis.tables.len());
        for table in &analysis.tables {
            let key = CacheKey::new(table.as_str(), scope.user_id, scope.case_id);
            if let Ok(Some(entry)) = self.local.get_cache(&key).await {
                ages.push(age_of(&entry, now));
            }
        }
        let score = hybrid_freshness_score(&ages);

        let strategy = if score > 0.7 {
            CacheStrategy::LocalFirst
        } else if score < 0.3 && self.is_connected() {
            CacheStrategy::RemoteFirst
        } else {
            match self.latency.faster(&analysis.query_hash) {
                Path::Local => CacheStrategy::LocalFirst,
                Path::Remote => CacheStrategy::RemoteFirst,
            }
        };
        debug!(score, %strategy, "Hybrid strategy resolved");
        strategy
    }

    fn schedule_refresh(
        &self,
        sql: &str,
        params: &Params,
        analysis: &QueryAnalysis,
        decision: &CacheRoutingDecision,
        scope: Scope<'_>,
    ) -> bool {
        if !decision.is_cacheable() {
            return false;
        }
        let key = format!(
            "{}:{}:{}",
            analysis.query_hash,
            scope.user_id.unwrap_or("*"),
            scope.case_id.unwrap_or("*")
        );

        let remote = Arc::clone(&self.remote);
        let local = Arc::clone(&self.local);
        let clock = Arc::clone(&self.clock);
        let registry = Arc::clone(self.registry());
        let connection = self.connection.clone();
        let sql = sql.to_string();
        let params = params.clone();
        let tables = analysis.tables.clone();
        let ttl = decision.cache_ttl;
        let user_id = scope.user_id.map(str::to_string);
        let case_id = scope.case_id.map(str::to_string);

        self.refresher.schedule(key, move || {
            let remote = Arc::clone(&remote);
            let local = Arc::clone(&local);
            let clock = Arc::clone(&clock);
            let registry = Arc::clone(&registry);
            let connected = connection.borrow().is_connected;
            let sql = sql.clone();
            let params = params.clone();
            let tables = tables.clone();
            let user_id = user_id.clone();
            let case_id = case_id.clone();
            async move {
                if !connected {
                    return Err(RouterError::NotConnected);
                }
                let rows = flatten(remote.query(&sql, &params).await?);
                populate_cache(
                    local.as_ref(),
                    &clock,
                    &registry,
                    &tables,
                    &rows,
                    ttl,
                    user_id.as_deref(),
                    case_id.as_deref(),
                )
                .await?;
                Ok(())
            }
        })
    }

    async fn after_write(&self, analysis: &QueryAnalysis, scope: Scope<'_>) {
        self.invalidate_tables(&analysis.tables, analysis.query_type.as_str(), scope.user_id, scope.case_id)
            .await;
    }

    /// Drop the scope's cache entries for tables a mutation touched and
    /// broadcast one `data_mutation` per table. Invalidation failures are
    /// logged; the mutation itself already succeeded.
    pub async fn invalidate_tables(
        &self,
        tables: &[String],
        operation: &str,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) {
        let mut invalidated = 0;
        for table in tables {
            let key = CacheKey::new(table.as_str(), user_id, case_id);
            match self.local.remove_cache(&key).await {
                Ok(()) => invalidated += 1,
                Err(e) => warn!(cache_key = %key, error = %e, "Failed to invalidate cache after write"),
            }
            self.events.broadcast(RouterEvent::DataMutation {
                table: table.clone(),
                operation: operation.to_string(),
                user_id: user_id.map(str::to_string),
                case_id: case_id.map(str::to_string),
            });
        }
        crate::metrics::record_invalidation("write", invalidated);
    }

    fn start_live_queries(&self, analysis: &QueryAnalysis, scope: Scope<'_>) {
        let Some(live) = &self.live else {
            return;
        };
        if !self.is_connected() {
            return;
        }
        let pending: Vec<String> = analysis
            .tables
            .iter()
            .filter(|t| !live.is_live(t, scope.user_id, scope.case_id))
            .cloned()
            .collect();
        if pending.is_empty() {
            return;
        }
        let live = Arc::clone(live);
        let user_id = scope.user_id.map(str::to_string);
        let case_id = scope.case_id.map(str::to_string);
        tokio::spawn(async move {
            if let Err(e) = live.start_tenant(&pending, user_id.as_deref(), case_id.as_deref()).await {
                warn!(error = %e, "Failed to start live queries");
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        analysis: &QueryAnalysis,
        sql: &str,
        source: DataSource,
        strategy: CacheStrategy,
        elapsed: Duration,
        cache_hit: Option<bool>,
        error: bool,
    ) {
        crate::metrics::record_execution(source.as_str(), strategy.as_str(), elapsed);
        if let Some(monitor) = &self.monitor {
            monitor.record_execution(ExecutionSample {
                query_hash: analysis.query_hash.clone(),
                query: normalize_query(sql),
                source,
                elapsed,
                cache_hit,
                error,
            });
        }
    }

    /// Apply a pushed change to cached entries of the notified table.
    /// Deletes invalidate; creates and updates patch the record in place.
    /// Returns the number of entries touched.
    pub async fn apply_change_notification(&self, notification: &ChangeNotification) -> Result<usize> {
        let table = notification.table.to_ascii_lowercase();
        let keys: Vec<CacheKey> = self
            .local
            .cache_keys()
            .await?
            .into_iter()
            .filter(|k| k.table == table)
            .collect();

        let mut touched = 0;
        match notification.action {
            ChangeAction::Delete => {
                for key in keys {
                    self.local.remove_cache(&key).await?;
                    touched += 1;
                }
                crate::metrics::record_invalidation("notification", touched);
            }
            ChangeAction::Create | ChangeAction::Update => {
                let record_case = notification.record.get(&self.tenant_field).and_then(Value::as_str);
                let ceiling = row_ceiling(self.registry(), &table);
                let now = self.clock.now_ms();
                for key in keys {
                    if let (Some(case), Some(record_case)) = (key.case_id.as_deref(), record_case) {
                        if case != record_case {
                            continue;
                        }
                    }
                    let Some(mut entry) = self.local.get_cache(&key).await? else {
                        continue;
                    };
                    upsert_row(&mut entry.data, notification.record.clone());
                    cap_rows(&mut entry.data, ceiling);
                    entry.sync_timestamp = now;
                    self.local.put_cache(&key, entry).await?;
                    touched += 1;
                }
            }
        }
        debug!(%table, action = ?notification.action, touched, "Applied change notification");
        Ok(touched)
    }

    /// Drop every expired cache entry; returns how many were removed.
    pub async fn cleanup_expired_cache(&self) -> Result<usize> {
        let _timer = crate::time_operation!("cache_cleanup");
        let now = self.clock.now_ms();
        let mut removed = 0;
        for key in self.local.cache_keys().await? {
            if let Some(entry) = self.local.get_cache(&key).await? {
                if entry.is_expired(now) {
                    self.local.remove_cache(&key).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "Expired cache entries cleaned up");
        }
        Ok(removed)
    }

    /// Fetch a tenant's rows of `table` from the remote and cache them
    /// under the tenant's scope. Returns the number of rows fetched.
    pub async fn preload_table(&self, table: &str, tenant: &TenantContext) -> Result<usize> {
        let _timer = crate::time_operation!("preload_table");
        if !self.is_connected() {
            return Err(RouterError::NotConnected);
        }
        let sql = format!("SELECT * FROM {} WHERE {} = $tenant_id", table, self.tenant_field);
        let mut params = Params::new();
        params.insert("tenant_id".into(), Value::String(tenant.tenant_id.clone()));

        let rows = flatten(self.remote.query(&sql, &params).await?);
        let ttl = self
            .registry()
            .get(table)
            .map(|p| p.default_ttl)
            .unwrap_or(DEFAULT_PRELOAD_TTL);
        if !ttl.is_zero() {
            populate_cache(
                self.local.as_ref(),
                &self.clock,
                self.registry(),
                &[table.to_ascii_lowercase()],
                &rows,
                ttl,
                tenant.user_id.as_deref(),
                Some(tenant.cache_case()),
            )
            .await?;
        }
        debug!(table, rows = rows.len(), "Table preloaded");
        Ok(rows.len())
    }

    /// Remove every cache entry of a user/case scope.
    pub async fn clear_scope(&self, user_id: Option<&str>, case_id: Option<&str>) -> Result<usize> {
        let removed = self.local.remove_cache_scope(user_id, case_id).await?;
        crate::metrics::record_invalidation("scope", removed);
        Ok(removed)
    }
}

fn flatten(sets: Vec<Vec<Value>>) -> Vec<Value> {
    sets.into_iter().flatten().collect()
}

fn upsert_row(rows: &mut Vec<Value>, record: Value) {
    let existing = record
        .get("id")
        .and_then(|id| rows.iter_mut().find(|r| r.get("id") == Some(id)));
    match existing {
        Some(row) => *row = record,
        None => rows.push(record),
    }
}

/// The profile's `max_cache_size` for `table`; unprofiled tables are unbounded.
fn row_ceiling(registry: &TablePolicyRegistry, table: &str) -> Option<usize> {
    registry.get(table).map(|p| p.max_cache_size)
}

/// Keep the newest `ceiling` rows; newer rows sit at the end.
fn cap_rows(rows: &mut Vec<Value>, ceiling: Option<usize>) {
    if let Some(max) = ceiling {
        if rows.len() > max {
            let excess = rows.len() - max;
            rows.drain(..excess);
        }
    }
}

/// Store remote rows in the cache. One table takes every row; several
/// tables take the rows whose `id` is prefixed with the table name.
/// Rows already cached for the scope are kept and updated by id, up to the
/// table's row ceiling. A ceiling of zero leaves the table uncached.
#[allow(clippy::too_many_arguments)]
async fn populate_cache(
    local: &dyn LocalStore,
    clock: &SharedClock,
    registry: &TablePolicyRegistry,
    tables: &[String],
    rows: &[Value],
    ttl: Duration,
    user_id: Option<&str>,
    case_id: Option<&str>,
) -> Result<()> {
    let now = clock.now_ms();
    let expires_at = now.saturating_add(ttl.as_millis() as u64);
    let cache_type = if ttl > PERSISTENT_TTL {
        CacheType::Persistent
    } else {
        CacheType::Temporary
    };

    for table in tables {
        let ceiling = row_ceiling(registry, table);
        if ceiling == Some(0) {
            continue;
        }
        let owned: Vec<Value> = if tables.len() == 1 {
            rows.to_vec()
        } else {
            let prefix = format!("{}:", table);
            rows.iter()
                .filter(|r| r.get("id").and_then(Value::as_str).is_some_and(|id| id.starts_with(&prefix)))
                .cloned()
                .collect()
        };

        let key = CacheKey::new(table.as_str(), user_id, case_id);
        let mut data = match local.get_cache(&key).await? {
            Some(existing) if !existing.is_expired(now) => existing.data,
            _ => Vec::new(),
        };
        for row in owned {
            upsert_row(&mut data, row);
        }
        cap_rows(&mut data, ceiling);
        local
            .put_cache(
                &key,
                CachedData {
                    data,
                    sync_timestamp: now,
                    expires_at: Some(expires_at),
                    cache_type,
                },
            )
            .await?;
    }
    Ok(())
}
