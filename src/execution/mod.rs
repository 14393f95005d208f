// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query execution across the local cache and the remote service.
//!
//! The [`CacheExecutionEngine`] analyzes each query, asks the decider for
//! a strategy, resolves `Hybrid` from cache freshness and observed
//! latency, then runs the strategy's [`plan::AttemptPlan`].

pub mod engine;
pub mod freshness;
pub mod plan;
pub mod refresh;

pub use engine::CacheExecutionEngine;
pub use freshness::{Freshness, LatencyHistory};
pub use plan::{plan_for, Attempt, AttemptPlan};

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::policy::CacheStrategy;

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Local,
    Remote,
    /// Served from the local cache while a remote refresh was scheduled.
    Hybrid,
}

impl DataSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Rows of every statement, in statement order.
    pub data: Vec<Value>,
    pub source: DataSource,
    pub execution_time: Duration,
    pub cache_hit: bool,
    /// Strategy the decider chose (before `Hybrid` resolution).
    pub strategy: CacheStrategy,
}

impl ExecutionResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
