// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tenant switch saga.
//!
//! A switch runs six weighted steps:
//!
//! | Step                 | Weight |
//! |----------------------|--------|
//! | validate             | 10     |
//! | stop subscriptions   | 15     |
//! | clean cache          | 20     |
//! | install context      | 10     |
//! | preload core tables  | 30     |
//! | start subscriptions  | 15     |
//!
//! Only one switch runs at a time. The whole saga races the configured
//! switch timeout. On failure the previous context is restored as well as
//! possible and the original error is returned; rollback problems are
//! only logged. [`TenantSwitchHandler::cancel_switch`] stops the saga
//! before its next step.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{info, instrument, warn};

use super::context::TenantContext;
use super::manager::MultiTenantManager;
use crate::clock::SharedClock;
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::events::{EventBus, RouterEvent};
use crate::subscription::LiveQueryManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStep {
    Validate,
    StopSubscriptions,
    CleanCache,
    InstallContext,
    Preload,
    StartSubscriptions,
}

impl SwitchStep {
    pub const ALL: [SwitchStep; 6] = [
        Self::Validate,
        Self::StopSubscriptions,
        Self::CleanCache,
        Self::InstallContext,
        Self::Preload,
        Self::StartSubscriptions,
    ];

    /// Share of the overall progress; the weights sum to 100.
    #[must_use]
    pub fn weight(&self) -> u8 {
        match self {
            Self::Validate => 10,
            Self::StopSubscriptions => 15,
            Self::CleanCache => 20,
            Self::InstallContext => 10,
            Self::Preload => 30,
            Self::StartSubscriptions => 15,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::StopSubscriptions => "stop_subscriptions",
            Self::CleanCache => "clean_cache",
            Self::InstallContext => "install_context",
            Self::Preload => "preload",
            Self::StartSubscriptions => "start_subscriptions",
        }
    }
}

impl std::fmt::Display for SwitchStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the current (or most recent) switch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantSwitchState {
    pub is_in_progress: bool,
    pub current_step: Option<SwitchStep>,
    /// 0..=100, non-decreasing; 100 only after a successful run.
    pub progress: u8,
    /// Epoch millis.
    pub start_time: u64,
    pub error: Option<String>,
    pub from_tenant: Option<String>,
    pub to_tenant: String,
    pub cancel_requested: bool,
}

pub struct TenantSwitchHandler {
    manager: Arc<MultiTenantManager>,
    live: Arc<LiveQueryManager>,
    events: EventBus,
    clock: SharedClock,
    preload_tables: Vec<String>,
    timeout: Duration,
    state: watch::Sender<Option<TenantSwitchState>>,
}

impl TenantSwitchHandler {
    #[must_use]
    pub fn new(
        manager: Arc<MultiTenantManager>,
        live: Arc<LiveQueryManager>,
        config: &RouterConfig,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            manager,
            live,
            events,
            clock,
            preload_tables: config.preload_tables.clone(),
            timeout: config.switch_timeout(),
            state,
        }
    }

    #[must_use]
    pub fn state(&self) -> Option<TenantSwitchState> {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<Option<TenantSwitchState>> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.state.borrow().as_ref().is_some_and(|s| s.is_in_progress)
    }

    /// Switch the current tenant to `target`.
    ///
    /// Rejected with [`RouterError::SwitchInProgress`] while another switch
    /// runs. Switching to the context already installed is a no-op.
    #[instrument(skip(self, target), fields(to = %target.tenant_id))]
    pub async fn switch_tenant(&self, target: TenantContext) -> Result<()> {
        let previous = self.manager.current_context();
        if previous.as_ref() == Some(&target) {
            return Ok(());
        }
        let from = previous.as_ref().map(|c| c.tenant_id.clone());

        let mut rejected = false;
        self.state.send_if_modified(|state| {
            if state.as_ref().is_some_and(|s| s.is_in_progress) {
                rejected = true;
                return false;
            }
            *state = Some(TenantSwitchState {
                is_in_progress: true,
                current_step: None,
                progress: 0,
                start_time: self.clock.now_ms(),
                error: None,
                from_tenant: from.clone(),
                to_tenant: target.tenant_id.clone(),
                cancel_requested: false,
            });
            true
        });
        if rejected {
            warn!(to = %target.tenant_id, "Tenant switch rejected: another switch is in progress");
            return Err(RouterError::SwitchInProgress);
        }

        info!(from = ?from, to = %target.tenant_id, "Tenant switch started");
        self.events.broadcast(RouterEvent::TenantSwitchStarted {
            from: from.clone(),
            to: target.tenant_id.clone(),
        });

        let started = Instant::now();
        let outcome = match timeout(self.timeout, self.run_steps(previous.as_ref(), &target)).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::Timeout(self.timeout)),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                self.state.send_modify(|state| {
                    if let Some(s) = state {
                        s.is_in_progress = false;
                        s.current_step = None;
                        s.progress = 100;
                    }
                });
                crate::metrics::record_tenant_switch("success", elapsed);
                info!(to = %target.tenant_id, ?elapsed, "Tenant switch completed");
                self.events.broadcast(RouterEvent::TenantSwitchCompleted {
                    tenant_id: target.tenant_id.clone(),
                    duration_ms: elapsed.as_millis() as u64,
                });
                Ok(())
            }
            Err(e) => {
                let rolled_back = self.rollback(previous, &target).await;
                self.state.send_modify(|state| {
                    if let Some(s) = state {
                        s.is_in_progress = false;
                        s.error = Some(e.to_string());
                    }
                });
                let outcome = match &e {
                    RouterError::SwitchCancelled(_) => "cancelled",
                    RouterError::Timeout(_) => "timeout",
                    _ => "failed",
                };
                crate::metrics::record_tenant_switch(outcome, elapsed);
                warn!(to = %target.tenant_id, error = %e, rolled_back, "Tenant switch failed");
                self.events.broadcast(RouterEvent::TenantSwitchFailed {
                    tenant_id: target.tenant_id.clone(),
                    error: e.to_string(),
                    rolled_back,
                });
                Err(e)
            }
        }
    }

    /// Ask the running switch to stop before its next step. Returns whether
    /// a switch was running.
    pub fn cancel_switch(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            Some(s) if s.is_in_progress && !s.cancel_requested => {
                s.cancel_requested = true;
                true
            }
            _ => false,
        })
    }

    async fn run_steps(&self, previous: Option<&TenantContext>, target: &TenantContext) -> Result<()> {
        for step in SwitchStep::ALL {
            let mut cancelled = false;
            self.state.send_modify(|state| {
                if let Some(s) = state {
                    cancelled = s.cancel_requested;
                    if !cancelled {
                        s.current_step = Some(step);
                    }
                }
            });
            if cancelled {
                return Err(RouterError::SwitchCancelled(step.as_str().to_string()));
            }

            self.run_step(step, previous, target).await?;

            let mut progress = 0;
            self.state.send_modify(|state| {
                if let Some(s) = state {
                    s.progress = s.progress.saturating_add(step.weight()).min(100);
                    progress = s.progress;
                }
            });
            self.events.broadcast(RouterEvent::TenantSwitchProgress {
                to: target.tenant_id.clone(),
                step,
                progress,
            });
        }
        Ok(())
    }

    async fn run_step(&self, step: SwitchStep, previous: Option<&TenantContext>, target: &TenantContext) -> Result<()> {
        let engine = self.manager.engine();
        match step {
            SwitchStep::Validate => {
                if target.tenant_id.trim().is_empty() {
                    return Err(RouterError::Validation("tenant id must not be empty".into()));
                }
            }
            SwitchStep::StopSubscriptions => {
                if let Some(prev) = previous {
                    self.live.stop_tenant(Some(prev.cache_case())).await?;
                }
            }
            SwitchStep::CleanCache => {
                if let Some(prev) = previous {
                    engine.clear_scope(prev.user_id.as_deref(), Some(prev.cache_case())).await?;
                }
            }
            SwitchStep::InstallContext => {
                self.manager.set_context(target.clone());
            }
            SwitchStep::Preload => {
                if !engine.is_connected() {
                    warn!(tenant_id = %target.tenant_id, "Offline: skipping tenant preload");
                    return Ok(());
                }
                for table in &self.preload_tables {
                    engine.preload_table(table, target).await?;
                }
            }
            SwitchStep::StartSubscriptions => {
                self.live
                    .start_tenant(&self.preload_tables, target.user_id.as_deref(), Some(target.cache_case()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Restore `previous` as well as possible. Returns whether the previous
    /// context is back in place.
    async fn rollback(&self, previous: Option<TenantContext>, target: &TenantContext) -> bool {
        if let Err(e) = self.live.stop_tenant(Some(target.cache_case())).await {
            warn!(tenant_id = %target.tenant_id, error = %e, "Rollback: failed to stop new subscriptions");
        }

        match previous {
            Some(prev) => {
                let tenant_id = prev.tenant_id.clone();
                let (user_id, case_id) = (prev.user_id.clone(), prev.cache_case().to_string());
                self.manager.set_context(prev);
                if let Err(e) = self
                    .live
                    .start_tenant(&self.preload_tables, user_id.as_deref(), Some(&case_id))
                    .await
                {
                    warn!(%tenant_id, error = %e, "Rollback: failed to restart subscriptions");
                    return false;
                }
                info!(%tenant_id, "Tenant switch rolled back");
            }
            None => {
                self.manager.clear_context();
                info!("Tenant switch rolled back to no tenant");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::execution::CacheExecutionEngine;
    use crate::policy::TablePolicyRegistry;
    use crate::storage::InMemoryStore;
    use crate::subscription::InMemorySubscriptions;
    use serde_json::json;

    struct Harness {
        handler: Arc<TenantSwitchHandler>,
        manager: Arc<MultiTenantManager>,
        remote: Arc<InMemoryStore>,
        subs: Arc<InMemorySubscriptions>,
        events: EventBus,
    }

    fn harness(config: RouterConfig) -> Harness {
        let remote = Arc::new(InMemoryStore::new());
        let local = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let events = EventBus::new(128);
        let engine = Arc::new(CacheExecutionEngine::new(
            Arc::new(TablePolicyRegistry::with_defaults()),
            remote.clone(),
            local,
            &config,
            events.clone(),
            clock.clone(),
        ));
        let manager = Arc::new(MultiTenantManager::new(engine, &config, clock.clone()));
        let subs = Arc::new(InMemorySubscriptions::default());
        let live = Arc::new(LiveQueryManager::new(subs.clone()));
        let handler = Arc::new(TenantSwitchHandler::new(
            manager.clone(),
            live,
            &config,
            events.clone(),
            clock,
        ));
        Harness {
            handler,
            manager,
            remote,
            subs,
            events,
        }
    }

    #[tokio::test]
    async fn test_switch_runs_all_steps() {
        let h = harness(RouterConfig::default());
        h.remote.insert_rows("case", vec![json!({"id": "case:a", "case_id": "a"})]);
        let mut rx = h.events.subscribe();

        h.handler.switch_tenant(TenantContext::new("a")).await.unwrap();
        assert_eq!(h.manager.current_context().unwrap().tenant_id, "a");
        assert_eq!(h.subs.active_count(), 3);

        let state = h.handler.state().unwrap();
        assert!(!state.is_in_progress);
        assert_eq!(state.progress, 100);
        assert!(state.error.is_none());

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RouterEvent::TenantSwitchProgress { progress: p, .. } = event {
                progress.push(p);
            }
        }
        assert_eq!(progress, vec![10, 25, 45, 55, 85, 100]);
    }

    #[tokio::test]
    async fn test_switch_to_current_is_noop() {
        let h = harness(RouterConfig::default());
        h.handler.switch_tenant(TenantContext::new("a")).await.unwrap();
        let before = h.handler.state();
        h.handler.switch_tenant(TenantContext::new("a")).await.unwrap();
        assert_eq!(h.handler.state(), before);
    }

    #[tokio::test]
    async fn test_preload_failure_rolls_back() {
        let h = harness(RouterConfig::default());
        h.handler.switch_tenant(TenantContext::new("a")).await.unwrap();

        // Remote stays "connected" for the engine but every call fails
        h.remote.set_available(false);
        let err = h.handler.switch_tenant(TenantContext::new("b")).await.unwrap_err();
        assert!(matches!(err, RouterError::Connection(_)));

        let state = h.handler.state().unwrap();
        assert!(!state.is_in_progress);
        assert!(state.error.is_some());
        assert!(state.progress < 100);
        assert_eq!(h.manager.current_context().unwrap().tenant_id, "a");
    }

    #[tokio::test]
    async fn test_empty_tenant_rejected_at_validation() {
        let h = harness(RouterConfig::default());
        let err = h.handler.switch_tenant(TenantContext::new(" ")).await.unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
        assert_eq!(h.handler.state().unwrap().progress, 0);
        assert!(h.manager.current_context().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_switch_rejected_and_cancel() {
        let h = harness(RouterConfig::default());
        h.remote.set_latency(Duration::from_secs(1));

        let handler = h.handler.clone();
        let first = tokio::spawn(async move { handler.switch_tenant(TenantContext::new("a")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.handler.is_in_progress());

        let err = h.handler.switch_tenant(TenantContext::new("b")).await.unwrap_err();
        assert_eq!(err, RouterError::SwitchInProgress);

        assert!(h.handler.cancel_switch());
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, RouterError::SwitchCancelled(_)));
        assert!(h.manager.current_context().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_times_out() {
        let config = RouterConfig {
            switch_timeout_ms: 500,
            ..RouterConfig::default()
        };
        let h = harness(config);
        h.remote.set_latency(Duration::from_secs(2));
        let err = h.handler.switch_tenant(TenantContext::new("a")).await.unwrap_err();
        assert!(matches!(err, RouterError::Timeout(_)));
        assert!(!h.handler.is_in_progress());
        assert!(h.manager.current_context().is_none());
    }
}
