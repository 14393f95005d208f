// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Router lifecycle: start, background tasks, shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{CacheRouter, RouterState};
use crate::execution::CacheExecutionEngine;
use crate::subscription::ChangeNotification;

impl CacheRouter {
    /// Start the router.
    ///
    /// Startup flow:
    /// 1. Connect to the remote. A failure is not fatal: the connection
    ///    manager keeps retrying and reads fall back to the local cache.
    /// 2. Start the performance monitor's snapshot and prune loops.
    /// 3. Drain subscription notifications into the cache.
    /// 4. Start the expired-cache cleanup loop.
    ///
    /// Calling `start` on a running router does nothing.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) {
        let mut skip = false;
        self.state.send_if_modified(|state| match state {
            RouterState::Starting | RouterState::Running => {
                skip = true;
                false
            }
            _ => {
                *state = RouterState::Starting;
                true
            }
        });
        if skip {
            debug!("Router already started");
            return;
        }
        let started = tokio::time::Instant::now();
        info!("Starting cache router...");

        // ========== Remote connection ==========
        if let Err(e) = self.connection.connect().await {
            warn!(error = %e, "Initial connect failed; serving from local cache until reconnected");
        }

        // ========== Monitor ==========
        self.monitor.start();

        // ========== Background tasks ==========
        {
            let mut tasks = self.tasks.lock();
            match self.subscriptions.notifications() {
                Some(rx) => tasks.push(spawn_notification_pump(self.engine.clone(), rx)),
                None => warn!("Notification stream already taken; live updates will not reach the cache"),
            }
            let every = Duration::from_millis(self.config.cache_cleanup_interval_ms);
            if !every.is_zero() {
                tasks.push(spawn_cache_cleanup(self.engine.clone(), every));
            }
        }

        let _ = self.state.send(RouterState::Running);
        info!(elapsed = ?started.elapsed(), connected = self.connection.is_connected(), "Cache router running");
    }

    /// Stop background work, close live subscriptions and disconnect.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Initiating cache router shutdown...");
        let _ = self.state.send(RouterState::ShuttingDown);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.monitor.stop();

        if let Err(e) = self.live.stop_tenant(None).await {
            warn!(error = %e, "Failed to close live subscriptions");
        }
        if let Err(e) = self.connection.disconnect().await {
            warn!(error = %e, "Error while closing remote");
        }

        let _ = self.state.send(RouterState::Stopped);
        info!("Cache router stopped");
    }
}

fn spawn_notification_pump(
    engine: Arc<CacheExecutionEngine>,
    mut rx: mpsc::Receiver<ChangeNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(e) = engine.apply_change_notification(&notification).await {
                warn!(table = %notification.table, error = %e, "Failed to apply change notification");
            }
        }
        debug!("Notification stream closed");
    })
}

fn spawn_cache_cleanup(engine: Arc<CacheExecutionEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = engine.cleanup_expired_cache().await {
                warn!(error = %e, "Cache cleanup failed");
            }
        }
    })
}
