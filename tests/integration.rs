// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Cache Router
//!
//! End-to-end scenarios through the [`CacheRouter`] facade, wired to the
//! in-memory store and subscription service. Timer-driven behavior runs
//! on a paused tokio clock so nothing waits in real time.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Only tenant scenarios
//! cargo test --test integration tenant
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: routing, caching, invalidation, lifecycle
//! - `tenant_*` - Isolation, switching, auditing
//! - `monitor_*` - Anomalies and reports

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cache_router::clock::ManualClock;
use cache_router::storage::{CacheKey, InMemoryStore, LocalStore, Params};
use cache_router::subscription::InMemorySubscriptions;
use cache_router::{
    AnomalyKind, CacheRouter, CacheStrategy, ConnectionPhase, DataSource, RouterConfig, RouterEvent, RouterState,
    TenantContext,
};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    router: CacheRouter,
    remote: Arc<InMemoryStore>,
    local: Arc<InMemoryStore>,
    subs: Arc<InMemorySubscriptions>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: RouterConfig) -> Harness {
    let remote = Arc::new(InMemoryStore::new());
    let local = Arc::new(InMemoryStore::new());
    let subs = Arc::new(InMemorySubscriptions::default());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let router = CacheRouter::new(config, remote.clone(), local.clone(), subs.clone(), clock.clone());
    Harness {
        router,
        remote,
        local,
        subs,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(RouterConfig::default())
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RouterEvent>) -> Vec<RouterEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test(start_paused = true)]
async fn happy_lifecycle_states() {
    let h = harness();
    let mut states = h.router.state_receiver();
    assert_eq!(h.router.state(), RouterState::Created);

    h.router.start().await;
    assert_eq!(*states.borrow_and_update(), RouterState::Running);
    assert!(h.router.status().is_healthy());

    // Second start is a no-op
    h.router.start().await;
    assert_eq!(h.remote.connect_attempts(), 1);

    h.router.shutdown().await;
    assert_eq!(h.router.state(), RouterState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn happy_personal_data_served_locally_when_offline() {
    let h = harness();
    h.router.start().await;
    h.remote.insert_rows("user_profile", vec![json!({"id": "user_profile:1", "theme": "dark"})]);

    let first = h
        .router
        .query("SELECT * FROM user_profile", &Params::new(), Some("alice"), None)
        .await
        .unwrap();
    assert_eq!(first.strategy, CacheStrategy::LocalFirst);
    assert_eq!(first.source, DataSource::Remote);

    h.remote.set_available(false);
    let second = h
        .router
        .query("SELECT * FROM user_profile", &Params::new(), Some("alice"), None)
        .await
        .unwrap();
    assert_eq!(second.source, DataSource::Local);
    assert!(second.cache_hit);
    assert_eq!(second.data[0]["theme"], "dark");

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn happy_write_is_remote_only_and_invalidates() {
    let h = harness();
    h.router.start().await;
    let mut events = h.router.subscribe_events();

    h.remote.insert_rows("claim", vec![json!({"id": "claim:1", "amount": 10})]);
    h.router
        .query("SELECT * FROM claim", &Params::new(), Some("u1"), Some("c1"))
        .await
        .unwrap();
    let key = CacheKey::new("claim", Some("u1"), Some("c1"));
    assert!(h.local.get_cache(&key).await.unwrap().is_some());

    let result = h
        .router
        .query("INSERT INTO claim { amount: 20 }", &Params::new(), Some("u1"), Some("c1"))
        .await
        .unwrap();
    assert_eq!(result.strategy, CacheStrategy::RemoteOnly);
    assert!(!result.cache_hit);
    assert!(h.local.get_cache(&key).await.unwrap().is_none());
    assert_eq!(h.remote.rows("claim").len(), 2);

    let mutations: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| e.event_type() == "data_mutation")
        .collect();
    assert_eq!(mutations.len(), 1);
    let wire = serde_json::to_value(&mutations[0]).unwrap();
    assert_eq!(wire["type"], "data_mutation");
    assert_eq!(wire["payload"]["table"], "claim");
    assert_eq!(wire["payload"]["operation"], "INSERT");

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn happy_profile_update_changes_routing() {
    let h = harness();
    h.router.start().await;
    h.router
        .registry()
        .update_profile("document", |p| p.default_strategy = CacheStrategy::RemoteOnly)
        .unwrap();

    h.remote.insert_rows("document", vec![json!({"id": "document:1"})]);
    let result = h.router.query("SELECT * FROM document", &Params::new(), None, None).await.unwrap();
    assert_eq!(result.strategy, CacheStrategy::RemoteOnly);
    assert_eq!(h.local.cache_len(), 0);

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn happy_delete_notification_invalidates_cache() {
    let h = harness();
    h.router.start().await;
    h.remote.insert_rows("claim", vec![json!({"id": "claim:1"})]);
    h.router.query("SELECT * FROM claim", &Params::new(), None, None).await.unwrap();
    assert_eq!(h.local.cache_len(), 1);

    h.subs.notify(cache_router::ChangeNotification {
        table: "claim".into(),
        action: cache_router::subscription::ChangeAction::Delete,
        record: json!({"id": "claim:1"}),
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h.local.cache_len(), 0);

    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn happy_expired_entries_cleaned_up() {
    let h = harness();
    h.router.start().await;
    h.remote.insert_rows("notification", vec![json!({"id": "notification:1"})]);
    h.router.query("SELECT * FROM notification", &Params::new(), None, None).await.unwrap();
    assert_eq!(h.local.cache_len(), 1);

    // notification entries live one minute
    h.clock.advance(Duration::from_secs(120));
    assert_eq!(h.router.cleanup_expired_cache().await.unwrap(), 1);
    assert_eq!(h.local.cache_len(), 0);

    h.router.shutdown().await;
}

// =============================================================================
// Tenants
// =============================================================================

#[tokio::test(start_paused = true)]
async fn tenant_queries_are_isolated() {
    let h = harness();
    h.router.start().await;
    h.remote.insert_rows(
        "claim",
        vec![
            json!({"id": "claim:1", "case_id": "a", "status": "open"}),
            json!({"id": "claim:2", "case_id": "b", "status": "open"}),
            json!({"id": "claim:3", "case_id": "a", "status": "closed"}),
        ],
    );

    h.router.switch_tenant(TenantContext::new("a")).await.unwrap();
    let result = h
        .router
        .tenant_query("SELECT * FROM claim WHERE status = 'open'", &Params::new())
        .await
        .unwrap();
    assert_eq!(result.data.len(), 1);
    assert_eq!(result.data[0]["id"], "claim:1");

    h.router.switch_tenant(TenantContext::new("b")).await.unwrap();
    let result = h
        .router
        .tenant_query("SELECT * FROM claim WHERE status = 'open'", &Params::new())
        .await
        .unwrap();
    assert_eq!(result.data.len(), 1);
    assert_eq!(result.data[0]["id"], "claim:2");

    assert_eq!(h.router.tenants().audits_for_tenant("a").len(), 1);
    assert_eq!(h.router.tenants().audits_for_tenant("b").len(), 1);
    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn tenant_switch_cleans_previous_scope() {
    let h = harness();
    h.router.start().await;
    h.remote.insert_rows("case", vec![json!({"id": "case:a", "case_id": "a"}), json!({"id": "case:b", "case_id": "b"})]);

    h.router.switch_tenant(TenantContext::new("a").with_user("u1")).await.unwrap();
    let a_key = CacheKey::new("case", Some("u1"), Some("a"));
    assert!(h.local.get_cache(&a_key).await.unwrap().is_some());

    h.router.switch_tenant(TenantContext::new("b").with_user("u1")).await.unwrap();
    assert!(h.local.get_cache(&a_key).await.unwrap().is_none());
    assert!(h
        .local
        .get_cache(&CacheKey::new("case", Some("u1"), Some("b")))
        .await
        .unwrap()
        .is_some());

    // Subscriptions moved with the tenant
    let active = h.subs.active();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|k| k.case_id.as_deref() == Some("b")));
    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn tenant_switch_emits_ordered_events() {
    let h = harness();
    h.router.start().await;
    let mut events = h.router.subscribe_events();

    h.router.switch_tenant(TenantContext::new("a")).await.unwrap();

    let kinds: Vec<&'static str> = drain(&mut events)
        .iter()
        .map(RouterEvent::event_type)
        .filter(|t| t.starts_with("tenant_switch"))
        .collect();
    assert_eq!(kinds.first(), Some(&"tenant_switch_started"));
    assert_eq!(kinds.last(), Some(&"tenant_switch_completed"));
    assert_eq!(kinds.iter().filter(|k| **k == "tenant_switch_progress").count(), 6);
    h.router.shutdown().await;
}

// =============================================================================
// Monitor
// =============================================================================

#[tokio::test(start_paused = true)]
async fn monitor_slow_remote_query_raises_anomaly() {
    let h = harness();
    h.router.start().await;
    let mut events = h.router.subscribe_events();

    h.remote.set_latency(Duration::from_secs(6));
    h.router.query("SELECT * FROM claim", &Params::new(), None, None).await.unwrap();

    let anomalies = h.router.monitor().anomalies();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, AnomalyKind::SlowQuery);
    assert!(drain(&mut events).iter().any(|e| e.event_type() == "performance_anomaly"));

    let report = h.router.performance_report();
    assert_eq!(report.total_executions, 1);
    assert_eq!(report.anomaly_counts.get(&AnomalyKind::SlowQuery), Some(&1));
    h.router.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn monitor_status_reflects_connection() {
    let h = harness();
    h.remote.set_available(false);
    h.router.start().await;

    let status = h.router.status();
    assert_eq!(status.connection, ConnectionPhase::Reconnecting);
    assert!(!status.connected);
    assert_eq!(status.reconnect_attempts, 1);

    h.remote.set_available(true);
    h.router.retry_connection().await.unwrap();
    assert!(h.router.status().connected);
    h.router.shutdown().await;
}
