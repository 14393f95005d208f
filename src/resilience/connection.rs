// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote connection supervision.
//!
//! # State machine
//!
//! ```text
//! Disconnected → Connecting → Connected
//!                    ↑            │ failure / health probe failure
//!                    │            ▼
//!                    └──── Reconnecting ──(attempts exhausted)──→ Degraded
//! ```
//!
//! Every failed attempt increments `reconnect_attempts`. Below the maximum
//! a retry is scheduled after `min(base * 2^(n-1), max)`; reaching it
//! enters `Degraded` and automatic retries stop until
//! [`ConnectionRecoveryManager::retry_connection`] is called.
//!
//! The current [`ConnectionState`] is published on a watch channel;
//! readers never mutate it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use super::retry::RetryConfig;
use crate::clock::SharedClock;
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::events::{EventBus, RouterEvent};
use crate::storage::RemoteService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Degraded,
}

impl ConnectionPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of remote reachability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub is_connected: bool,
    pub is_connecting: bool,
    /// Epoch millis.
    pub last_connected_at: Option<u64>,
    pub last_disconnected_at: Option<u64>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub next_reconnect_delay_ms: u64,
    pub error: Option<String>,
}

impl ConnectionState {
    #[must_use]
    pub fn new(max_reconnect_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            is_connected: false,
            is_connecting: false,
            last_connected_at: None,
            last_disconnected_at: None,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            next_reconnect_delay_ms: initial_delay.as_millis() as u64,
            error: None,
        }
    }

    /// A connected snapshot, for components used without a manager.
    #[must_use]
    pub fn connected() -> Self {
        let mut state = Self::new(0, Duration::ZERO);
        state.phase = ConnectionPhase::Connected;
        state.is_connected = true;
        state
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.phase == ConnectionPhase::Degraded
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        self.phase = phase;
        self.is_connected = phase == ConnectionPhase::Connected;
        self.is_connecting = phase == ConnectionPhase::Connecting;
    }
}

#[derive(Default)]
struct Tasks {
    retry: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
}

/// Supervises the remote connection: timed connects, backoff retries,
/// health probing and degraded mode.
pub struct ConnectionRecoveryManager {
    remote: Arc<dyn RemoteService>,
    backoff: RetryConfig,
    connect_timeout: Duration,
    health_interval: Duration,
    state: watch::Sender<ConnectionState>,
    events: EventBus,
    clock: SharedClock,
    tasks: Mutex<Tasks>,
    me: Weak<Self>,
}

impl ConnectionRecoveryManager {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteService>, config: &RouterConfig, events: EventBus, clock: SharedClock) -> Arc<Self> {
        let backoff = RetryConfig::from_router_config(config);
        let initial = ConnectionState::new(config.max_reconnect_attempts, backoff.initial_delay);
        let (state, _rx) = watch::channel(initial);
        Arc::new_cyclic(|me| Self {
            remote,
            backoff,
            connect_timeout: config.connect_timeout(),
            health_interval: Duration::from_millis(config.health_check_interval_ms),
            state,
            events,
            clock,
            tasks: Mutex::new(Tasks::default()),
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected
    }

    /// One connect attempt raced against the connect timeout. A failure is
    /// handled (retry scheduled or degraded) before it is returned.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        // Check-then-set without suspension in between
        let mut already = None;
        self.state.send_if_modified(|s| match s.phase {
            ConnectionPhase::Connected | ConnectionPhase::Connecting => {
                already = Some(s.phase);
                false
            }
            _ => {
                s.set_phase(ConnectionPhase::Connecting);
                true
            }
        });
        if let Some(phase) = already {
            debug!(%phase, "Connect skipped");
            return Ok(());
        }
        self.announce();

        let attempt = match timeout(self.connect_timeout, self.remote.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RouterError::from(e)),
            Err(_) => Err(RouterError::Timeout(self.connect_timeout)),
        };

        match attempt {
            Ok(()) => {
                self.on_connected();
                Ok(())
            }
            Err(e) => {
                self.handle_connection_failure(&e.to_string());
                Err(e)
            }
        }
    }

    fn on_connected(&self) {
        let now = self.clock.now_ms();
        let initial = self.backoff.initial_delay;
        self.state.send_modify(|s| {
            s.set_phase(ConnectionPhase::Connected);
            s.last_connected_at = Some(now);
            s.reconnect_attempts = 0;
            s.next_reconnect_delay_ms = initial.as_millis() as u64;
            s.error = None;
        });
        info!("Remote connected");
        self.announce();
        self.start_health_check();
    }

    /// Count a failure and either schedule the next attempt or enter
    /// degraded mode.
    pub fn handle_connection_failure(&self, error: &str) {
        self.stop_health_check();
        crate::metrics::record_error(crate::error::ErrorCategory::Connection.as_str());

        let now = self.clock.now_ms();
        let backoff = &self.backoff;
        let mut scheduled = None;
        self.state.send_modify(|s| {
            if s.is_connected {
                s.last_disconnected_at = Some(now);
            }
            s.reconnect_attempts += 1;
            s.error = Some(error.to_string());
            if s.reconnect_attempts >= s.max_reconnect_attempts {
                s.set_phase(ConnectionPhase::Degraded);
            } else {
                let delay = backoff.delay_for_attempt(s.reconnect_attempts);
                s.next_reconnect_delay_ms = delay.as_millis() as u64;
                s.set_phase(ConnectionPhase::Reconnecting);
                scheduled = Some((s.reconnect_attempts, delay));
            }
        });
        self.announce();

        let snapshot = self.state();
        match scheduled {
            Some((attempt, delay)) => {
                warn!(attempt, ?delay, error, "Connection failed, reconnect scheduled");
                crate::metrics::record_reconnect_attempt(attempt, delay);
                self.events.broadcast(RouterEvent::ReconnectionScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
                self.schedule_retry(delay);
            }
            None => {
                error!(attempts = snapshot.reconnect_attempts, error, "Reconnect attempts exhausted, entering degraded mode");
                if let Some(task) = self.tasks.lock().retry.take() {
                    task.abort();
                }
                self.events.broadcast(RouterEvent::ConnectionDegraded {
                    attempts: snapshot.reconnect_attempts,
                    error: snapshot.error,
                });
            }
        }
    }

    /// Manual reconnect: resets attempts and delay, then connects.
    #[instrument(skip(self))]
    pub async fn retry_connection(&self) -> Result<()> {
        if let Some(task) = self.tasks.lock().retry.take() {
            task.abort();
        }
        let initial = self.backoff.initial_delay;
        self.state.send_modify(|s| {
            s.reconnect_attempts = 0;
            s.next_reconnect_delay_ms = initial.as_millis() as u64;
            s.error = None;
            if s.phase != ConnectionPhase::Connected {
                s.set_phase(ConnectionPhase::Disconnected);
            }
        });
        info!("Manual reconnect requested");
        self.connect().await
    }

    /// Cancel pending retry and health tasks, then close the remote.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.retry.take() {
                task.abort();
            }
            if let Some(task) = tasks.health.take() {
                task.abort();
            }
        }

        let closed = self.remote.close().await;

        let now = self.clock.now_ms();
        self.state.send_modify(|s| {
            if s.is_connected {
                s.last_disconnected_at = Some(now);
            }
            s.set_phase(ConnectionPhase::Disconnected);
        });
        info!("Remote disconnected");
        self.announce();
        closed.map_err(RouterError::from)
    }

    fn announce(&self) {
        let snapshot = self.state();
        crate::metrics::set_connection_state(snapshot.phase.as_str(), snapshot.is_connected);
        self.events.broadcast(RouterEvent::ConnectionStateChange(snapshot));
    }

    fn schedule_retry(&self, delay: Duration) {
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let Some(me) = me.upgrade() else {
                return;
            };
            if let Err(e) = me.connect().await {
                debug!(error = %e, "Scheduled reconnect failed");
            }
        });
        if let Some(previous) = self.tasks.lock().retry.replace(task) {
            previous.abort();
        }
    }

    fn start_health_check(&self) {
        if self.health_interval.is_zero() {
            return;
        }
        let me = self.me.clone();
        let interval = self.health_interval;
        let probe_timeout = self.connect_timeout;
        let task = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(me) = me.upgrade() else {
                    return;
                };
                let outcome = match timeout(probe_timeout, me.remote.ping()).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("health probe timed out after {:?}", probe_timeout)),
                };
                if let Some(error) = outcome {
                    warn!(%error, "Health probe failed");
                    // Detach our own handle; the failure path aborts whatever is stored there
                    me.tasks.lock().health.take();
                    me.handle_connection_failure(&error);
                    return;
                }
            }
        });
        if let Some(previous) = self.tasks.lock().health.replace(task) {
            previous.abort();
        }
    }

    fn stop_health_check(&self) {
        if let Some(task) = self.tasks.lock().health.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectionRecoveryManager {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(task) = tasks.retry.take() {
            task.abort();
        }
        if let Some(task) = tasks.health.take() {
            task.abort();
        }
    }
}
