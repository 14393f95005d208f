// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router facade.
//!
//! The [`CacheRouter`] wires the components together:
//! - connection recovery for the remote service
//! - the execution engine (analyzer, decider, local/remote attempt plans)
//! - the performance monitor
//! - tenant isolation and the tenant switch saga
//! - live subscriptions and the change-notification pump
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cache_router::{CacheRouter, RouterConfig, RouterState};
//! use cache_router::clock::system_clock;
//! use cache_router::storage::{InMemoryStore, Params};
//! use cache_router::subscription::InMemorySubscriptions;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let router = CacheRouter::new(
//!     RouterConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemorySubscriptions::default()),
//!     system_clock(),
//! );
//! assert_eq!(router.state(), RouterState::Created);
//!
//! router.start().await;
//! let result = router.query("SELECT * FROM claim", &Params::new(), None, None).await;
//! router.shutdown().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{RouterState, RouterStatus};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::RouterConfig;
use crate::error::ErrorTracker;
use crate::events::EventBus;
use crate::execution::CacheExecutionEngine;
use crate::monitor::PerformanceMonitor;
use crate::policy::TablePolicyRegistry;
use crate::resilience::ConnectionRecoveryManager;
use crate::storage::{LocalStore, RemoteService};
use crate::subscription::{LiveQueryManager, SubscriptionService};
use crate::tenant::{MultiTenantManager, TenantSwitchHandler};

/// Local-first query router.
///
/// All methods take `&self`; share the router behind an `Arc`.
pub struct CacheRouter {
    pub(super) config: RouterConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<RouterState>,

    pub(super) events: EventBus,
    pub(super) clock: SharedClock,
    pub(super) errors: Arc<ErrorTracker>,

    pub(super) connection: Arc<ConnectionRecoveryManager>,
    pub(super) engine: Arc<CacheExecutionEngine>,
    pub(super) monitor: Arc<PerformanceMonitor>,

    pub(super) subscriptions: Arc<dyn SubscriptionService>,
    pub(super) live: Arc<LiveQueryManager>,

    pub(super) tenants: Arc<MultiTenantManager>,
    pub(super) switcher: TenantSwitchHandler,

    /// Notification pump and cache cleanup
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheRouter {
    /// Create a router with the built-in table profiles.
    ///
    /// The router starts in `Created` state. Call [`start()`](Self::start)
    /// to connect and begin background work.
    #[must_use]
    pub fn new(
        config: RouterConfig,
        remote: Arc<dyn RemoteService>,
        local: Arc<dyn LocalStore>,
        subscriptions: Arc<dyn SubscriptionService>,
        clock: SharedClock,
    ) -> Self {
        Self::with_registry(
            config,
            Arc::new(TablePolicyRegistry::with_defaults()),
            remote,
            local,
            subscriptions,
            clock,
        )
    }

    /// Create a router with a caller-supplied profile registry.
    #[must_use]
    pub fn with_registry(
        config: RouterConfig,
        registry: Arc<TablePolicyRegistry>,
        remote: Arc<dyn RemoteService>,
        local: Arc<dyn LocalStore>,
        subscriptions: Arc<dyn SubscriptionService>,
        clock: SharedClock,
    ) -> Self {
        let (state, _rx) = watch::channel(RouterState::Created);
        let events = EventBus::new(config.event_channel_capacity);
        let errors = Arc::new(ErrorTracker::new());

        let connection = ConnectionRecoveryManager::new(remote.clone(), &config, events.clone(), clock.clone());
        let monitor = PerformanceMonitor::new(config.monitor.clone(), clock.clone(), Some(events.clone()));
        let live = Arc::new(LiveQueryManager::new(subscriptions.clone()));

        let engine = Arc::new(
            CacheExecutionEngine::new(registry, remote, local, &config, events.clone(), clock.clone())
                .with_connection(connection.state_receiver())
                .with_monitor(monitor.clone())
                .with_live_queries(live.clone())
                .with_error_tracker(errors.clone()),
        );
        let tenants = Arc::new(MultiTenantManager::new(engine.clone(), &config, clock.clone()));
        let switcher = TenantSwitchHandler::new(tenants.clone(), live.clone(), &config, events.clone(), clock.clone());

        Self {
            config,
            state,
            events,
            clock,
            errors,
            connection,
            engine,
            monitor,
            subscriptions,
            live,
            tenants,
            switcher,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RouterState {
        *self.state.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<RouterState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == RouterState::Running
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<CacheExecutionEngine> {
        &self.engine
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TablePolicyRegistry> {
        self.engine.registry()
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionRecoveryManager> {
        &self.connection
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn tenants(&self) -> &Arc<MultiTenantManager> {
        &self.tenants
    }

    #[must_use]
    pub fn live_queries(&self) -> &Arc<LiveQueryManager> {
        &self.live
    }

    #[must_use]
    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl Drop for CacheRouter {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
