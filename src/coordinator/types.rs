// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the router facade.

use serde::Serialize;

use crate::resilience::ConnectionPhase;

/// Router lifecycle state.
///
/// Use [`super::CacheRouter::state()`] to check the current state or
/// [`super::CacheRouter::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    /// Just created, not yet started
    Created,
    /// Connecting and starting background tasks
    Starting,
    /// Serving queries
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// Background tasks stopped, remote closed
    Stopped,
}

impl std::fmt::Display for RouterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time summary for health endpoints and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStatus {
    pub state: RouterState,
    pub connection: ConnectionPhase,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub tenant_id: Option<String>,
    pub switch_in_progress: bool,
    pub live_subscriptions: usize,
    pub tracked_queries: usize,
    pub cache_hit_rate: Option<f64>,
}

impl RouterStatus {
    /// Running and not cut off from the remote for good.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == RouterState::Running && self.connection != ConnectionPhase::Degraded
    }
}
