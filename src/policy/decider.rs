// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Strategy decider.
//!
//! Turns a [`QueryAnalysis`] into a [`CacheRoutingDecision`] with an ordered
//! rule list; the first matching rule wins:
//!
//! ```text
//! 1. personal data (not a write)      → LOCAL_FIRST, 1h, live query
//! 2. any write / non-SELECT           → REMOTE_ONLY, TTL 0
//! 3. simple single-table select       → table profile, nudged by frequency
//! 4. joins or aggregations            → LOCAL_FIRST (hot) / REMOTE_FIRST
//! 5. multi-table, no joins            → LOCAL_FIRST (all low volatility, warm) / REMOTE_FIRST
//! 6. anything else                    → HYBRID, 30 min
//! ```
//!
//! Decisions depend on the runtime frequency score and are never cached.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::registry::{DataVolatility, TablePolicyRegistry};
use super::{CacheStrategy, ConsistencyLevel};
use crate::query::{QueryAnalysis, QueryType};
use crate::tenant::TenantContext;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Routing decision for one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheRoutingDecision {
    pub strategy: CacheStrategy,
    pub consistency_level: ConsistencyLevel,
    pub cache_ttl: Duration,
    pub enable_live_query: bool,
    pub enable_incremental_sync: bool,
    pub priority: u8,
    /// Human-readable rule trace.
    pub reasoning: String,
}

impl CacheRoutingDecision {
    fn new(strategy: CacheStrategy, consistency_level: ConsistencyLevel, cache_ttl: Duration, reasoning: String) -> Self {
        Self {
            strategy,
            consistency_level,
            cache_ttl,
            enable_live_query: false,
            enable_incremental_sync: false,
            priority: 5,
            reasoning,
        }
    }

    /// Whether results of this decision may be written to the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        !self.cache_ttl.is_zero() && self.strategy != CacheStrategy::RemoteOnly
    }
}

pub struct StrategyDecider {
    registry: Arc<TablePolicyRegistry>,
}

impl StrategyDecider {
    #[must_use]
    pub fn new(registry: Arc<TablePolicyRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TablePolicyRegistry> {
        &self.registry
    }

    pub fn decide_cache_strategy(
        &self,
        analysis: &QueryAnalysis,
        user_id: Option<&str>,
        tenant: Option<&TenantContext>,
    ) -> CacheRoutingDecision {
        let mut decision = self.decide(analysis);
        if let Some(tenant) = tenant {
            decision.reasoning.push_str(&format!(" [tenant {}]", tenant.tenant_id));
        } else if let Some(user) = user_id {
            decision.reasoning.push_str(&format!(" [user {}]", user));
        }
        debug!(
            strategy = %decision.strategy,
            ttl_secs = decision.cache_ttl.as_secs(),
            reasoning = %decision.reasoning,
            "Cache strategy decided"
        );
        decision
    }

    fn decide(&self, analysis: &QueryAnalysis) -> CacheRoutingDecision {
        let freq = analysis.frequency_score;

        if analysis.is_personal_data_query && !analysis.query_type.is_write() {
            let mut d = CacheRoutingDecision::new(
                CacheStrategy::LocalFirst,
                ConsistencyLevel::Eventual,
                HOUR,
                "personal data query: serve from local cache, keep fresh with live query".into(),
            );
            d.enable_live_query = true;
            d.enable_incremental_sync = true;
            d.priority = 9;
            return d;
        }

        if analysis.query_type != QueryType::Select {
            let mut d = CacheRoutingDecision::new(
                CacheStrategy::RemoteOnly,
                ConsistencyLevel::Strong,
                Duration::ZERO,
                format!("{} statement: remote only, never cached", analysis.query_type),
            );
            d.priority = 10;
            return d;
        }

        if analysis.is_simple_select && analysis.tables.len() == 1 {
            return self.decide_single_table(&analysis.tables[0], freq);
        }

        if analysis.has_joins || analysis.has_aggregations {
            return if freq > 0.7 {
                let mut d = CacheRoutingDecision::new(
                    CacheStrategy::LocalFirst,
                    ConsistencyLevel::Eventual,
                    15 * MINUTE,
                    format!("hot complex query (frequency {:.2}): cache locally", freq),
                );
                d.enable_incremental_sync = true;
                d.priority = 7;
                d
            } else {
                CacheRoutingDecision::new(
                    CacheStrategy::RemoteFirst,
                    ConsistencyLevel::Strong,
                    5 * MINUTE,
                    format!("complex query (frequency {:.2}): remote first", freq),
                )
            };
        }

        if analysis.tables.len() > 1 {
            let all_low = analysis.tables.iter().all(|t| {
                self.registry
                    .get(t)
                    .is_some_and(|p| p.data_volatility == DataVolatility::Low)
            });
            return if all_low && freq > 0.5 {
                let mut d = CacheRoutingDecision::new(
                    CacheStrategy::LocalFirst,
                    ConsistencyLevel::Eventual,
                    20 * MINUTE,
                    format!("multi-table query over stable tables (frequency {:.2})", freq),
                );
                d.enable_incremental_sync = true;
                d
            } else {
                CacheRoutingDecision::new(
                    CacheStrategy::RemoteFirst,
                    ConsistencyLevel::Strong,
                    10 * MINUTE,
                    "multi-table query: remote first for cross-table consistency".into(),
                )
            };
        }

        CacheRoutingDecision::new(
            CacheStrategy::Hybrid,
            ConsistencyLevel::Eventual,
            30 * MINUTE,
            "no specific rule matched: hybrid".into(),
        )
    }

    fn decide_single_table(&self, table: &str, freq: f64) -> CacheRoutingDecision {
        let Some(profile) = self.registry.get(table) else {
            return CacheRoutingDecision::new(
                CacheStrategy::Hybrid,
                ConsistencyLevel::Eventual,
                30 * MINUTE,
                format!("no profile for table '{}': hybrid", table),
            );
        };

        let mut strategy = profile.default_strategy;
        let mut priority = profile.priority;
        let mut reasoning = format!("table profile '{}' ({})", profile.table, profile.default_strategy);

        if freq > 0.8 && strategy == CacheStrategy::RemoteFirst {
            strategy = CacheStrategy::Hybrid;
            priority = priority.saturating_add(1).min(10);
            reasoning.push_str(&format!(", hot query ({:.2}) nudged to hybrid", freq));
        } else if freq < 0.3 && strategy == CacheStrategy::LocalFirst {
            strategy = CacheStrategy::Hybrid;
            priority = priority.saturating_sub(1).max(1);
            reasoning.push_str(&format!(", cold query ({:.2}) nudged to hybrid", freq));
        }

        let mut ttl = profile.default_ttl;
        match profile.data_volatility {
            DataVolatility::High if ttl > 10 * MINUTE => {
                ttl = 10 * MINUTE;
                reasoning.push_str(", ttl capped for volatile data");
            }
            DataVolatility::Low if ttl < HOUR => {
                ttl = HOUR;
                reasoning.push_str(", ttl raised for stable data");
            }
            _ => {}
        }
        if strategy == CacheStrategy::RemoteOnly {
            ttl = Duration::ZERO;
        }

        let local_capable = matches!(strategy, CacheStrategy::LocalFirst | CacheStrategy::Hybrid);
        CacheRoutingDecision {
            strategy,
            consistency_level: profile.consistency_requirement,
            cache_ttl: ttl,
            enable_live_query: local_capable && profile.data_volatility != DataVolatility::Low,
            enable_incremental_sync: local_capable,
            priority,
            reasoning,
        }
    }
}
