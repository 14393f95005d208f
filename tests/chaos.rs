// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos Testing for the Cache Router
//!
//! This module tests failure scenarios using:
//! 1. **FailingRemote wrapper** - precise error injection after N queries
//! 2. **Outages** - the remote refusing connections for minutes at a time
//! 3. **Slow backends** - latency that outlasts switch timeouts
//! 4. **Broken collaborators** - a subscription service that rejects calls
//!
//! All timers run on a paused tokio clock, so a ten-attempt backoff
//! schedule completes instantly.
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use cache_router::clock::ManualClock;
use cache_router::storage::{CacheKey, DataStore, InMemoryStore, LocalStore, Params, ResultSet};
use cache_router::subscription::InMemorySubscriptions;
use cache_router::{
    CacheRouter, ConnectionPhase, DataSource, RemoteService, RouterConfig, RouterError, RouterEvent,
    StorageError, TenantContext,
};

// =============================================================================
// Failing Remote Wrapper - Precise Error Injection
// =============================================================================

/// Wraps an [`InMemoryStore`] and injects failures.
///
/// - `fail_after(n)`: statements beyond the n-th fail with `Unavailable`
/// - `refuse_connections(true)`: `connect` and `ping` fail
pub struct FailingRemote {
    inner: Arc<InMemoryStore>,
    query_calls: AtomicU64,
    connect_calls: AtomicU64,
    /// Queries allowed before failing; `u64::MAX` = never fail
    fail_after: AtomicU64,
    refuse_connections: AtomicBool,
}

impl FailingRemote {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            query_calls: AtomicU64::new(0),
            connect_calls: AtomicU64::new(0),
            fail_after: AtomicU64::new(u64::MAX),
            refuse_connections: AtomicBool::new(false),
        }
    }

    pub fn fail_after(&self, n: u64) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// Fail every query from now on.
    pub fn fail_now(&self) {
        self.fail_after(self.query_calls.load(Ordering::SeqCst));
    }

    pub fn heal(&self) {
        self.fail_after(u64::MAX);
        self.refuse_connections.store(false, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    fn check_query(&self) -> Result<(), StorageError> {
        let n = self.query_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.fail_after.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable(format!("injected failure on call {}", n)))
        } else {
            Ok(())
        }
    }

    fn check_connection(&self) -> Result<(), StorageError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataStore for FailingRemote {
    async fn query(&self, statement: &str, params: &Params) -> Result<Vec<ResultSet>, StorageError> {
        self.check_query()?;
        self.inner.query(statement, params).await
    }

    async fn select(&self, thing: &str) -> Result<Vec<Value>, StorageError> {
        self.check_query()?;
        self.inner.select(thing).await
    }

    async fn create(&self, thing: &str, data: Value) -> Result<Value, StorageError> {
        self.check_query()?;
        self.inner.create(thing, data).await
    }

    async fn update(&self, thing: &str, data: Value) -> Result<Value, StorageError> {
        self.check_query()?;
        self.inner.update(thing, data).await
    }

    async fn merge(&self, thing: &str, data: Value) -> Result<Value, StorageError> {
        self.check_query()?;
        self.inner.merge(thing, data).await
    }

    async fn delete(&self, thing: &str) -> Result<Option<Value>, StorageError> {
        self.check_query()?;
        self.inner.delete(thing).await
    }
}

#[async_trait]
impl RemoteService for FailingRemote {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.check_connection()?;
        self.inner.connect().await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_connection()?;
        self.inner.ping().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Chaos {
    router: Arc<CacheRouter>,
    remote: Arc<FailingRemote>,
    backing: Arc<InMemoryStore>,
    local: Arc<InMemoryStore>,
    subs: Arc<InMemorySubscriptions>,
    clock: Arc<ManualClock>,
}

fn chaos_with(config: RouterConfig) -> Chaos {
    let backing = Arc::new(InMemoryStore::new());
    let remote = Arc::new(FailingRemote::new(backing.clone()));
    let local = Arc::new(InMemoryStore::new());
    let subs = Arc::new(InMemorySubscriptions::default());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let router = Arc::new(CacheRouter::new(config, remote.clone(), local.clone(), subs.clone(), clock.clone()));
    Chaos {
        router,
        remote,
        backing,
        local,
        subs,
        clock,
    }
}

fn chaos() -> Chaos {
    chaos_with(RouterConfig::default())
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RouterEvent>) -> Vec<RouterEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// =============================================================================
// Connection Outages
// =============================================================================

#[tokio::test(start_paused = true)]
async fn chaos_outage_exhausts_reconnects_then_degrades() {
    let c = chaos();
    c.remote.refuse_connections(true);
    let mut events = c.router.subscribe_events();

    c.router.start().await;
    // Backoff 1+2+4+8+16+30*4 seconds; auto-advance runs every retry
    tokio::time::sleep(Duration::from_secs(600)).await;

    let state = c.router.connection_state();
    assert_eq!(state.phase, ConnectionPhase::Degraded);
    assert_eq!(state.reconnect_attempts, 10);
    assert_eq!(c.remote.connect_calls(), 10);
    assert!(!c.router.status().is_healthy());

    let seen = drain(&mut events);
    let scheduled = seen.iter().filter(|e| e.event_type() == "reconnection_scheduled").count();
    assert_eq!(scheduled, 9);
    assert_eq!(seen.iter().filter(|e| e.event_type() == "connection_degraded").count(), 1);

    // Degraded mode stops retrying
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(c.remote.connect_calls(), 10);

    c.remote.heal();
    c.router.retry_connection().await.unwrap();
    let state = c.router.connection_state();
    assert_eq!(state.phase, ConnectionPhase::Connected);
    assert_eq!(state.reconnect_attempts, 0);
    assert!(c.router.status().is_healthy());

    c.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_reconnect_succeeds_mid_backoff() {
    let c = chaos();
    c.remote.refuse_connections(true);
    c.router.start().await;

    // Attempts at t=0, 1s, 3s fail
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(c.remote.connect_calls(), 3);
    c.remote.heal();

    // Next attempt at t=7s
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(c.remote.connect_calls(), 4);
    assert_eq!(c.router.connection_state().phase, ConnectionPhase::Connected);
    assert_eq!(c.router.connection_state().reconnect_attempts, 0);

    c.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_health_probe_detects_dead_remote() {
    let c = chaos();
    c.router.start().await;
    assert!(c.router.status().connected);

    c.remote.refuse_connections(true);
    // Probe fires after 30s; the first reconnect follows a second later
    tokio::time::sleep(Duration::from_secs(31)).await;

    let state = c.router.connection_state();
    assert!(!state.is_connected);
    assert!(state.reconnect_attempts >= 1);

    c.router.shutdown().await;
}

// =============================================================================
// Query Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn chaos_remote_dies_cache_serves_reads() {
    let c = chaos();
    c.router.start().await;
    c.backing.insert_rows("claim", vec![json!({"id": "claim:1", "amount": 5})]);

    let fresh = c.router.query("SELECT * FROM claim", &Params::new(), None, None).await.unwrap();
    assert_eq!(fresh.source, DataSource::Remote);

    c.remote.fail_now();
    let fallback = c.router.query("SELECT * FROM claim", &Params::new(), None, None).await.unwrap();
    assert_eq!(fallback.source, DataSource::Local);
    assert!(fallback.cache_hit);
    assert_eq!(fallback.data, vec![json!({"id": "claim:1", "amount": 5})]);

    // Uncached table: nothing to fall back on
    let err = c
        .router
        .query("SELECT * FROM document", &Params::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Connection(_)));

    c.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_failed_write_keeps_cache() {
    let c = chaos();
    c.router.start().await;
    c.backing.insert_rows("claim", vec![json!({"id": "claim:1"})]);
    c.router.query("SELECT * FROM claim", &Params::new(), None, None).await.unwrap();
    let mut events = c.router.subscribe_events();

    c.remote.fail_now();
    let err = c
        .router
        .query("UPDATE claim SET amount = 9 WHERE id = 'claim:1'", &Params::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Connection(_)));

    assert!(c
        .local
        .get_cache(&CacheKey::new("claim", None, None))
        .await
        .unwrap()
        .is_some());
    assert!(drain(&mut events).iter().all(|e| e.event_type() != "data_mutation"));
    assert_eq!(c.router.errors().count(cache_router::ErrorCategory::Connection), 1);

    c.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_stale_cache_survives_failed_refresh() {
    let c = chaos();
    c.router.start().await;
    c.backing.insert_rows("user", vec![json!({"id": "user:1", "name": "Ada"})]);
    c.router
        .query("SELECT * FROM user", &Params::new(), Some("user:1"), None)
        .await
        .unwrap();

    c.clock.advance(Duration::from_secs(40 * 60));
    c.remote.fail_now();
    let stale = c
        .router
        .query("SELECT * FROM user", &Params::new(), Some("user:1"), None)
        .await
        .unwrap();
    assert_eq!(stale.source, DataSource::Hybrid);
    assert_eq!(stale.data[0]["name"], "Ada");

    // Let the background refresh run through its retries
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(c.remote.query_calls() >= 2);

    let entry = c
        .local
        .get_cache(&CacheKey::new("user", Some("user:1"), None))
        .await
        .unwrap();
    assert!(entry.is_some());

    c.router.shutdown().await;
}

// =============================================================================
// Tenant Switch Failures
// =============================================================================

fn seed_tenants(backing: &InMemoryStore) {
    backing.insert_rows(
        "claim",
        vec![json!({"id": "claim:a", "case_id": "a"}), json!({"id": "claim:b", "case_id": "b"})],
    );
}

#[tokio::test(start_paused = true)]
async fn chaos_preload_failure_rolls_back_to_previous_tenant() {
    let c = chaos();
    c.router.start().await;
    seed_tenants(&c.backing);
    c.router.switch_tenant(TenantContext::new("a")).await.unwrap();
    let mut events = c.router.subscribe_events();

    c.remote.fail_now();
    let err = c.router.switch_tenant(TenantContext::new("b")).await.unwrap_err();
    assert!(matches!(err, RouterError::Connection(_)));

    assert_eq!(c.router.current_tenant().unwrap().tenant_id, "a");
    let state = c.router.switch_state().unwrap();
    assert!(!state.is_in_progress);
    assert!(state.error.is_some());

    let failed = drain(&mut events)
        .into_iter()
        .find_map(|e| match e {
            RouterEvent::TenantSwitchFailed { tenant_id, rolled_back, .. } => Some((tenant_id, rolled_back)),
            _ => None,
        })
        .expect("switch failure event");
    assert_eq!(failed, ("b".to_string(), true));

    // Subscriptions for the restored tenant are back
    assert_eq!(c.subs.active_count(), 3);
    assert!(c.subs.active().iter().all(|k| k.case_id.as_deref() == Some("a")));

    c.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_concurrent_switch_rejected() {
    let c = chaos();
    c.router.start().await;
    seed_tenants(&c.backing);
    c.backing.set_latency(Duration::from_secs(1));

    let router = c.router.clone();
    let first = tokio::spawn(async move { router.switch_tenant(TenantContext::new("a")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(c.router.status().switch_in_progress);

    let err = c.router.switch_tenant(TenantContext::new("b")).await.unwrap_err();
    assert_eq!(err, RouterError::SwitchInProgress);

    first.await.unwrap().unwrap();
    assert_eq!(c.router.current_tenant().unwrap().tenant_id, "a");
    assert!(!c.router.status().switch_in_progress);

    c.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_slow_preload_times_out() {
    let mut config = RouterConfig::default();
    config.switch_timeout_ms = 5_000;
    let c = chaos_with(config);
    c.router.start().await;
    seed_tenants(&c.backing);
    c.backing.set_latency(Duration::from_secs(20));

    let err = c.router.switch_tenant(TenantContext::new("a")).await.unwrap_err();
    assert!(matches!(err, RouterError::Timeout(_)));
    assert!(c.router.current_tenant().is_none());
    assert!(!c.router.status().switch_in_progress);

    c.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn chaos_subscription_outage_fails_switch() {
    let c = chaos();
    c.router.start().await;
    seed_tenants(&c.backing);
    c.subs.set_failing(true);

    let err = c.router.switch_tenant(TenantContext::new("a")).await.unwrap_err();
    assert!(matches!(err, RouterError::Connection(_)));
    assert!(c.router.current_tenant().is_none());
    assert_eq!(c.subs.active_count(), 0);

    c.subs.set_failing(false);
    c.router.switch_tenant(TenantContext::new("a")).await.unwrap();
    assert_eq!(c.subs.active_count(), 3);

    c.router.shutdown().await;
}
