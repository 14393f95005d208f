// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Cache Router
//!
//! A local-first query router. Every query or mutation is analyzed, given a
//! caching strategy, and executed against an embedded local store, a remote
//! data service, or both, while keeping tenants isolated and the cache fresh.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CacheRouter facade                      │
//! │  • query / tenant_query / switch_tenant                     │
//! │  • lifecycle, notification pump, cache cleanup              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Query Analyzer → Strategy Decider                │
//! │  • statement intent, tables, frequency score                │
//! │  • table profiles → strategy, TTL, live-query flag          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Cache Execution Engine                     │
//! │  • ordered local/remote attempt plans with fallback         │
//! │  • cache population, invalidation, background refresh       │
//! └─────────────────────────────────────────────────────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌───────────────────────────┐     ┌───────────────────────────┐
//! │       Local store         │     │      Remote service       │
//! │  cache table + queries    │     │  connection recovery,     │
//! │                           │     │  backoff, degraded mode   │
//! └───────────────────────────┘     └───────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_router::{CacheRouter, RouterConfig, TenantContext};
//! use cache_router::clock::system_clock;
//! use cache_router::storage::{InMemoryStore, Params};
//! use cache_router::subscription::InMemorySubscriptions;
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = CacheRouter::new(
//!         RouterConfig::default(),
//!         Arc::new(InMemoryStore::new()),
//!         Arc::new(InMemoryStore::new()),
//!         Arc::new(InMemorySubscriptions::default()),
//!         system_clock(),
//!     );
//!     router.start().await;
//!
//!     router
//!         .switch_tenant(TenantContext::new("case-42").with_user("alice"))
//!         .await
//!         .expect("switch failed");
//!
//!     let result = router
//!         .tenant_query("SELECT * FROM claim WHERE status = 'open'", &Params::new())
//!         .await
//!         .expect("query failed");
//!     println!("{} rows from {}", result.data.len(), result.source);
//!
//!     router.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Strategy Decisions**: personal data local-first, writes remote-only,
//!   per-table profiles for everything else
//! - **Fallback Execution**: local ↔ remote with degrade-to-empty for reads
//! - **Background Refresh**: stale cache served immediately, refreshed behind
//! - **Connection Recovery**: exponential backoff, health probes, degraded mode
//! - **Tenant Isolation**: query rewriting, permission checks, audit trail
//! - **Tenant Switching**: weighted saga with timeout, cancellation and rollback
//! - **Performance Monitoring**: per-query timing, anomaly detection, trends
//!
//! ## Configuration
//!
//! See [`RouterConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`CacheRouter`] facade
//! - [`query`]: Statement parsing and query analysis
//! - [`policy`]: Table profiles and the strategy decider
//! - [`execution`]: Attempt plans, freshness, background refresh
//! - [`resilience`]: Connection recovery and retry
//! - [`tenant`]: Tenant context, isolation, switch saga
//! - [`monitor`]: Performance metrics and anomalies
//! - [`storage`]: Local/remote contracts and the in-memory store

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod execution;
pub mod metrics;
pub mod monitor;
pub mod policy;
pub mod query;
pub mod resilience;
pub mod storage;
pub mod subscription;
pub mod tenant;

pub use config::{MonitorConfig, RouterConfig};
pub use coordinator::{CacheRouter, RouterState, RouterStatus};
pub use error::{ErrorCategory, ErrorSeverity, ErrorTracker, Result, RouterError};
pub use events::{EventBus, RouterEvent};
pub use execution::{CacheExecutionEngine, DataSource, ExecutionResult};
pub use monitor::{Anomaly, AnomalyKind, PerformanceMonitor, PerformanceReport};
pub use policy::{CacheRoutingDecision, CacheStrategy, ConsistencyLevel, StrategyDecider, TableCacheProfile, TablePolicyRegistry};
pub use query::{QueryAnalysis, QueryAnalyzer, QueryType};
pub use resilience::{ConnectionPhase, ConnectionRecoveryManager, ConnectionState, RetryConfig};
pub use storage::{CacheKey, CachedData, LocalStore, RemoteService, StorageError};
pub use subscription::{ChangeNotification, LiveQueryManager, SubscriptionService};
pub use tenant::{MultiTenantManager, TenantContext, TenantSwitchHandler, TenantSwitchState};
pub use metrics::LatencyTimer;
