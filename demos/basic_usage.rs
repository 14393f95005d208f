// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cache-router usage example.
//!
//! Demonstrates:
//! 1. Wiring the router to an in-memory remote and local store
//! 2. Routing reads: remote first, then cached, then offline fallback
//! 3. A write that invalidates the cache
//! 4. Switching tenants and running isolated queries
//! 5. Displaying the performance report and raw metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//!
//! # With debug logs
//! RUST_LOG=cache_router=debug cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use cache_router::clock::system_clock;
use cache_router::storage::{InMemoryStore, Params};
use cache_router::subscription::InMemorySubscriptions;
use cache_router::{CacheRouter, RouterConfig, RouterState, TenantContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures everything the router emits)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cache_router=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           cache-router: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Wire and start the router
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Seeding the remote...");
    let remote = Arc::new(InMemoryStore::new());
    remote.insert_rows(
        "claim",
        vec![
            json!({"id": "claim:1", "case_id": "case-a", "status": "open", "amount": 1200}),
            json!({"id": "claim:2", "case_id": "case-a", "status": "closed", "amount": 300}),
            json!({"id": "claim:3", "case_id": "case-b", "status": "open", "amount": 950}),
        ],
    );
    remote.insert_rows("user", vec![json!({"id": "user:alice", "name": "Alice", "locale": "en-GB"})]);

    let local = Arc::new(InMemoryStore::new());
    let router = CacheRouter::new(
        RouterConfig::default(),
        remote.clone(),
        local.clone(),
        Arc::new(InMemorySubscriptions::default()),
        system_clock(),
    );
    println!("   State: {}", router.state());

    println!("\n🚀 Starting router...");
    router.start().await;
    assert_eq!(router.state(), RouterState::Running);
    println!("   ✅ Running, connected: {}", router.status().connected);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Reads: first from the remote, then from cache, then offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Routing reads...");
    let sql = "SELECT * FROM user";
    let first = router.query(sql, &Params::new(), Some("user:alice"), None).await?;
    println!(
        "   └─ {} → {} rows from {} ({}, {:?})",
        sql,
        first.data.len(),
        first.source,
        first.strategy,
        first.execution_time
    );

    let second = router.query(sql, &Params::new(), Some("user:alice"), None).await?;
    println!(
        "   └─ again → {} (cache hit: {}, {:?})",
        second.source, second.cache_hit, second.execution_time
    );

    println!("\n📴 Taking the remote offline...");
    remote.set_available(false);
    let offline = router.query(sql, &Params::new(), Some("user:alice"), None).await?;
    println!("   └─ offline → {} rows from {}", offline.data.len(), offline.source);
    remote.set_available(true);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. A write goes to the remote and invalidates the cache
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing...");
    let mut events = router.subscribe_events();
    let write = router
        .query(
            "UPDATE user SET locale = 'fr-FR' WHERE id = 'user:alice'",
            &Params::new(),
            Some("user:alice"),
            None,
        )
        .await?;
    println!("   └─ {} row(s) updated via {}", write.data.len(), write.strategy);
    while let Ok(event) = events.try_recv() {
        println!("   └─ event: {}", serde_json::to_string(&event)?);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Tenants
    // ─────────────────────────────────────────────────────────────────────────
    for tenant in ["case-a", "case-b"] {
        println!("\n🏢 Switching to tenant {}...", tenant);
        router
            .switch_tenant(TenantContext::new(tenant).with_user("user:alice"))
            .await?;
        let open = router
            .tenant_query("SELECT * FROM claim WHERE status = 'open'", &Params::new())
            .await?;
        for row in &open.data {
            println!("   └─ {} amount={}", row["id"], row["amount"]);
        }
    }
    println!("   Audit entries: {}", router.recent_audits(100).len());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Reports
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Performance report:");
    let report = router.performance_report();
    println!("   ├─ Executions: {} ({} errors)", report.total_executions, report.total_errors);
    match report.cache_hit_rate {
        Some(rate) => println!("   ├─ Cache hit rate: {:.1}%", rate * 100.0),
        None => println!("   ├─ Cache hit rate: (no lookups)"),
    }
    for q in &report.slowest_queries {
        println!("   └─ {} x{} avg {:.3}ms", q.query, q.executions, q.avg_time_ms);
    }

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    router.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", router.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print captured metrics grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = Vec::new();
    let mut gauges = Vec::new();
    let mut histograms = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", labels.join(","))
        };
        let name = key.name().to_string();

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
