// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query, tenant and connection operations on the router.

use serde_json::Value;
use tokio::sync::broadcast;

use super::{CacheRouter, RouterStatus};
use crate::error::Result;
use crate::events::RouterEvent;
use crate::execution::ExecutionResult;
use crate::monitor::PerformanceReport;
use crate::resilience::ConnectionState;
use crate::storage::Params;
use crate::tenant::{TenantAccessAudit, TenantContext, TenantSwitchState};

impl CacheRouter {
    /// Route a query for an explicit user/case scope, without tenant
    /// isolation.
    pub async fn query(
        &self,
        sql: &str,
        params: &Params,
        user_id: Option<&str>,
        case_id: Option<&str>,
    ) -> Result<ExecutionResult> {
        self.engine.execute_query(sql, params, user_id, case_id).await
    }

    /// Route a query under the current tenant: the statement is rewritten
    /// with the tenant predicate and access is validated and audited.
    pub async fn tenant_query(&self, sql: &str, params: &Params) -> Result<ExecutionResult> {
        self.tenants.tenant_query(sql, params).await
    }

    /// Create a record stamped with the current tenant.
    pub async fn tenant_create(&self, table: &str, data: Value) -> Result<Value> {
        self.tenants.tenant_create(table, data).await
    }

    /// Switch the current tenant (single-flight saga with rollback).
    pub async fn switch_tenant(&self, target: TenantContext) -> Result<()> {
        self.switcher.switch_tenant(target).await
    }

    /// Ask a running tenant switch to stop before its next step.
    pub fn cancel_switch(&self) -> bool {
        self.switcher.cancel_switch()
    }

    #[must_use]
    pub fn switch_state(&self) -> Option<TenantSwitchState> {
        self.switcher.state()
    }

    #[must_use]
    pub fn current_tenant(&self) -> Option<TenantContext> {
        self.tenants.current_context()
    }

    /// Reset the reconnect budget and connect now (leaves degraded mode).
    pub async fn retry_connection(&self) -> Result<()> {
        self.connection.retry_connection().await
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Receive connection, tenant switch, mutation and anomaly events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn performance_report(&self) -> PerformanceReport {
        self.monitor.report()
    }

    /// Remove expired cache entries now instead of waiting for the
    /// maintenance task.
    pub async fn cleanup_expired_cache(&self) -> Result<usize> {
        self.engine.cleanup_expired_cache().await
    }

    /// Newest first.
    #[must_use]
    pub fn recent_audits(&self, limit: usize) -> Vec<TenantAccessAudit> {
        self.tenants.recent_audits(limit)
    }

    #[must_use]
    pub fn status(&self) -> RouterStatus {
        let connection = self.connection.state();
        RouterStatus {
            state: self.state(),
            connection: connection.phase,
            connected: connection.is_connected,
            reconnect_attempts: connection.reconnect_attempts,
            tenant_id: self.tenants.current_context().map(|c| c.tenant_id),
            switch_in_progress: self.switcher.is_in_progress(),
            live_subscriptions: self.live.len(),
            tracked_queries: self.monitor.tracked_queries(),
            cache_hit_rate: self.monitor.report().cache_hit_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RouterConfig;
    use crate::coordinator::RouterState;
    use crate::execution::DataSource;
    use crate::resilience::ConnectionPhase;
    use crate::storage::{CacheKey, InMemoryStore, LocalStore};
    use crate::subscription::{ChangeAction, ChangeNotification, InMemorySubscriptions};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        router: CacheRouter,
        remote: Arc<InMemoryStore>,
        local: Arc<InMemoryStore>,
        subs: Arc<InMemorySubscriptions>,
    }

    fn harness() -> Harness {
        let remote = Arc::new(InMemoryStore::new());
        let local = Arc::new(InMemoryStore::new());
        let subs = Arc::new(InMemorySubscriptions::default());
        let router = CacheRouter::new(
            RouterConfig::default(),
            remote.clone(),
            local.clone(),
            subs.clone(),
            Arc::new(ManualClock::new(1_000)),
        );
        Harness {
            router,
            remote,
            local,
            subs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown() {
        let h = harness();
        assert_eq!(h.router.state(), RouterState::Created);
        h.router.start().await;
        assert!(h.router.is_running());
        assert_eq!(h.router.connection_state().phase, ConnectionPhase::Connected);

        h.router.shutdown().await;
        assert_eq!(h.router.state(), RouterState::Stopped);
        assert_eq!(h.router.connection_state().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_offline_still_serves_cache() {
        let h = harness();
        h.remote.set_available(false);
        h.router.start().await;
        assert!(h.router.is_running());
        assert!(!h.router.status().connected);

        let result = h.router.query("SELECT * FROM claim", &Params::new(), None, None).await;
        assert!(result.is_err());
        h.router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_pump_patches_cache() {
        let h = harness();
        h.router.start().await;
        h.remote.insert_rows("claim", vec![json!({"id": "claim:1", "status": "open"})]);
        let result = h.router.query("SELECT * FROM claim", &Params::new(), None, None).await.unwrap();
        assert_eq!(result.source, DataSource::Remote);

        assert!(h.subs.notify(ChangeNotification {
            table: "claim".into(),
            action: ChangeAction::Update,
            record: json!({"id": "claim:1", "status": "closed"}),
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let entry = h.local.get_cache(&CacheKey::new("claim", None, None)).await.unwrap().unwrap();
        assert_eq!(entry.data[0]["status"], "closed");
        h.router.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_and_tenant_query() {
        let h = harness();
        h.router.start().await;
        h.remote.insert_rows(
            "claim",
            vec![json!({"id": "claim:1", "case_id": "a"}), json!({"id": "claim:2", "case_id": "b"})],
        );

        h.router.switch_tenant(TenantContext::new("a").with_user("u1")).await.unwrap();
        assert_eq!(h.router.current_tenant().unwrap().tenant_id, "a");
        assert_eq!(h.router.status().live_subscriptions, 3);

        let result = h.router.tenant_query("SELECT * FROM claim", &Params::new()).await.unwrap();
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0]["id"], "claim:1");
        assert_eq!(h.router.recent_audits(1)[0].tenant_id, "a");
        h.router.shutdown().await;
    }
}
