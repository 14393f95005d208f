// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client broadcast channel.
//!
//! Connection state, tenant-switch progress and mutation notices are
//! pushed to UI consumers through an [`EventBus`]. Consumers register with
//! [`EventBus::subscribe`] and tear down by dropping the receiver. Events
//! serialize as `{"type": ..., "payload": ...}`.
//!
//! # Example
//!
//! ```
//! use cache_router::events::{EventBus, RouterEvent};
//!
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//! bus.broadcast(RouterEvent::ReconnectionScheduled { attempt: 1, delay_ms: 1000 });
//! assert_eq!(rx.try_recv().unwrap().event_type(), "reconnection_scheduled");
//! ```

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::monitor::Anomaly;
use crate::resilience::connection::ConnectionState;
use crate::tenant::switch::SwitchStep;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RouterEvent {
    ConnectionStateChange(ConnectionState),
    ReconnectionScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    ConnectionDegraded {
        attempts: u32,
        error: Option<String>,
    },
    TenantSwitchStarted {
        from: Option<String>,
        to: String,
    },
    TenantSwitchProgress {
        to: String,
        step: SwitchStep,
        progress: u8,
    },
    TenantSwitchCompleted {
        tenant_id: String,
        duration_ms: u64,
    },
    TenantSwitchFailed {
        tenant_id: String,
        error: String,
        rolled_back: bool,
    },
    DataMutation {
        table: String,
        operation: String,
        user_id: Option<String>,
        case_id: Option<String>,
    },
    PerformanceAnomaly(Anomaly),
}

impl RouterEvent {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionStateChange(_) => "connection_state_change",
            Self::ReconnectionScheduled { .. } => "reconnection_scheduled",
            Self::ConnectionDegraded { .. } => "connection_degraded",
            Self::TenantSwitchStarted { .. } => "tenant_switch_started",
            Self::TenantSwitchProgress { .. } => "tenant_switch_progress",
            Self::TenantSwitchCompleted { .. } => "tenant_switch_completed",
            Self::TenantSwitchFailed { .. } => "tenant_switch_failed",
            Self::DataMutation { .. } => "data_mutation",
            Self::PerformanceAnomaly(_) => "performance_anomaly",
        }
    }
}

/// Fan-out channel for [`RouterEvent`]s.
///
/// Sending never blocks. Events sent with no subscribers are dropped; a
/// subscriber that falls more than `capacity` events behind lags.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RouterEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn broadcast(&self, event: RouterEvent) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => trace!(event_type, receivers, "Broadcast event"),
            Err(_) => trace!(event_type, "No receivers for event"),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
