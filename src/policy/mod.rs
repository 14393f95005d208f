// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing policy: per-table profiles and the strategy decider.

pub mod decider;
pub mod registry;

pub use decider::{CacheRoutingDecision, StrategyDecider};
pub use registry::{AccessPattern, DataVolatility, TableCacheProfile, TablePolicyRegistry};

use serde::{Deserialize, Serialize};

/// Where a query is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStrategy {
    LocalFirst,
    RemoteFirst,
    LocalOnly,
    RemoteOnly,
    Hybrid,
}

impl CacheStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalFirst => "LOCAL_FIRST",
            Self::RemoteFirst => "REMOTE_FIRST",
            Self::LocalOnly => "LOCAL_ONLY",
            Self::RemoteOnly => "REMOTE_ONLY",
            Self::Hybrid => "HYBRID",
        }
    }
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    Strong,
    Eventual,
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strong => write!(f, "strong"),
            Self::Eventual => write!(f, "eventual"),
        }
    }
}
