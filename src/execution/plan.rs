// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered attempt plans.
//!
//! Each strategy maps to a fixed list of steps tried in order and what to
//! do once every step has been tried:
//!
//! | Strategy      | Steps                              | Exhausted          |
//! |---------------|------------------------------------|--------------------|
//! | `LocalFirst`  | local (non-empty), remote (cache)  | empty result       |
//! | `RemoteFirst` | remote (cache), local (non-empty)  | first remote error |
//! | `LocalOnly`   | local (empty ok)                   | empty result       |
//! | `RemoteOnly`  | remote                             | first remote error |
//!
//! `Hybrid` is resolved to `LocalFirst` or `RemoteFirst` before planning.

use serde::Serialize;

use crate::error::RouterError;
use crate::policy::CacheStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Attempt {
    /// Cached local data. `accept_empty` ends the plan on an empty result.
    Local { accept_empty: bool },
    /// Remote service; successful reads repopulate the cache.
    Remote,
}

impl Attempt {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhausted {
    /// Degrade to an empty local result.
    Empty,
    /// Surface the first remote error (or `NotConnected`).
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptPlan {
    pub strategy: CacheStrategy,
    pub steps: Vec<Attempt>,
    pub on_exhausted: Exhausted,
}

impl AttemptPlan {
    /// Whether any step reads the cache.
    #[must_use]
    pub fn consults_cache(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Attempt::Local { .. }))
    }
}

/// Attempt plan for an already resolved strategy.
#[must_use]
pub fn plan_for(strategy: CacheStrategy) -> AttemptPlan {
    use Attempt::*;
    let (steps, on_exhausted) = match strategy {
        CacheStrategy::LocalFirst | CacheStrategy::Hybrid => {
            (vec![Local { accept_empty: false }, Remote], Exhausted::Empty)
        }
        CacheStrategy::RemoteFirst => (vec![Remote, Local { accept_empty: false }], Exhausted::Fail),
        CacheStrategy::LocalOnly => (vec![Local { accept_empty: true }], Exhausted::Empty),
        CacheStrategy::RemoteOnly => (vec![Remote], Exhausted::Fail),
    };
    AttemptPlan {
        strategy,
        steps,
        on_exhausted,
    }
}

/// Why a step did not produce the result.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// No usable cached data for every referenced table.
    CacheMiss,
    /// Ran but returned nothing, and the step needs rows.
    Empty,
    Failed(RouterError),
}

/// Per-attempt outcomes of one execution.
#[derive(Debug, Default)]
pub struct AttemptLog {
    entries: Vec<(Attempt, StepOutcome)>,
}

impl AttemptLog {
    pub fn push(&mut self, attempt: Attempt, outcome: StepOutcome) {
        self.entries.push((attempt, outcome));
    }

    #[must_use]
    pub fn entries(&self) -> &[(Attempt, StepOutcome)] {
        &self.entries
    }

    #[must_use]
    pub fn first_remote_error(&self) -> Option<&RouterError> {
        self.entries.iter().find_map(|(attempt, outcome)| match (attempt, outcome) {
            (Attempt::Remote, StepOutcome::Failed(e)) => Some(e),
            _ => None,
        })
    }

    #[must_use]
    pub fn first_error(&self) -> Option<&RouterError> {
        self.entries.iter().find_map(|(_, outcome)| match outcome {
            StepOutcome::Failed(e) => Some(e),
            _ => None,
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
