// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table policy registry.
//!
//! One [`TableCacheProfile`] per table, seeded at construction. Profiles
//! change only through [`TablePolicyRegistry::update_profile`] and
//! [`TablePolicyRegistry::upsert_profile`].

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{CacheStrategy, ConsistencyLevel};
use crate::error::{Result, RouterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataVolatility {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPattern {
    ReadHeavy,
    WriteHeavy,
    Balanced,
}

/// Caching profile for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCacheProfile {
    pub table: String,
    pub default_strategy: CacheStrategy,
    pub consistency_requirement: ConsistencyLevel,
    /// Queries per minute observed in production.
    pub avg_query_frequency: f64,
    pub data_volatility: DataVolatility,
    pub access_pattern: AccessPattern,
    /// Max cached rows for this table.
    pub max_cache_size: usize,
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    /// 1 (lowest) to 10 (highest).
    pub priority: u8,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl TableCacheProfile {
    #[allow(clippy::too_many_arguments)]
    fn seed(
        table: &str,
        default_strategy: CacheStrategy,
        consistency_requirement: ConsistencyLevel,
        avg_query_frequency: f64,
        data_volatility: DataVolatility,
        access_pattern: AccessPattern,
        max_cache_size: usize,
        ttl_secs: u64,
        priority: u8,
    ) -> Self {
        Self {
            table: table.to_string(),
            default_strategy,
            consistency_requirement,
            avg_query_frequency,
            data_volatility,
            access_pattern,
            max_cache_size,
            default_ttl: Duration::from_secs(ttl_secs),
            priority,
        }
    }
}

/// Built-in profiles for the case-management schema.
#[must_use]
pub fn default_profiles() -> Vec<TableCacheProfile> {
    use AccessPattern::*;
    use CacheStrategy::*;
    use ConsistencyLevel::*;
    use DataVolatility::*;

    const MIN: u64 = 60;
    const HOUR: u64 = 60 * MIN;

    vec![
        // Identity and navigation: tiny, read constantly, rarely change
        TableCacheProfile::seed("user", LocalFirst, Eventual, 50.0, Low, ReadHeavy, 1_000, 2 * HOUR, 9),
        TableCacheProfile::seed("user_profile", LocalFirst, Eventual, 30.0, Low, ReadHeavy, 1_000, 2 * HOUR, 8),
        TableCacheProfile::seed("role", LocalFirst, Eventual, 20.0, Low, ReadHeavy, 200, 24 * HOUR, 8),
        TableCacheProfile::seed("permission", LocalFirst, Eventual, 20.0, Low, ReadHeavy, 500, 24 * HOUR, 8),
        TableCacheProfile::seed("menu", LocalFirst, Eventual, 10.0, Low, ReadHeavy, 200, 24 * HOUR, 7),
        TableCacheProfile::seed("code_table", LocalFirst, Eventual, 15.0, Low, ReadHeavy, 5_000, 24 * HOUR, 6),
        // Case data: shared, edited by several people
        TableCacheProfile::seed("case", Hybrid, Eventual, 25.0, Medium, Balanced, 2_000, 15 * MIN, 7),
        TableCacheProfile::seed("claim", RemoteFirst, Strong, 40.0, High, Balanced, 5_000, 5 * MIN, 8),
        TableCacheProfile::seed("claim_item", RemoteFirst, Strong, 30.0, High, Balanced, 10_000, 5 * MIN, 6),
        TableCacheProfile::seed("document", RemoteFirst, Eventual, 15.0, Medium, ReadHeavy, 2_000, 30 * MIN, 5),
        TableCacheProfile::seed("contact", LocalFirst, Eventual, 10.0, Low, ReadHeavy, 5_000, 4 * HOUR, 5),
        TableCacheProfile::seed("notification", RemoteFirst, Eventual, 20.0, High, WriteHeavy, 500, MIN, 4),
        TableCacheProfile::seed("audit_log", RemoteOnly, Strong, 5.0, High, WriteHeavy, 0, 0, 2),
    ]
}

pub struct TablePolicyRegistry {
    profiles: RwLock<HashMap<String, TableCacheProfile>>,
}

impl TablePolicyRegistry {
    /// Registry seeded with [`default_profiles`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_profiles(default_profiles())
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::from_profiles(Vec::new())
    }

    #[must_use]
    pub fn from_profiles(profiles: Vec<TableCacheProfile>) -> Self {
        let map = profiles
            .into_iter()
            .map(|p| (p.table.to_ascii_lowercase(), p))
            .collect();
        Self {
            profiles: RwLock::new(map),
        }
    }

    #[must_use]
    pub fn get(&self, table: &str) -> Option<TableCacheProfile> {
        self.profiles.read().get(&table.to_ascii_lowercase()).cloned()
    }

    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.profiles.read().contains_key(&table.to_ascii_lowercase())
    }

    /// Modify an existing profile. Unknown tables are rejected.
    pub fn update_profile<F>(&self, table: &str, update: F) -> Result<TableCacheProfile>
    where
        F: FnOnce(&mut TableCacheProfile),
    {
        let key = table.to_ascii_lowercase();
        let mut profiles = self.profiles.write();
        let profile = profiles
            .get_mut(&key)
            .ok_or_else(|| RouterError::Validation(format!("no cache profile for table '{}'", table)))?;
        update(profile);
        profile.table = key;
        profile.priority = profile.priority.clamp(1, 10);
        info!(table = %profile.table, strategy = %profile.default_strategy, "Table cache profile updated");
        Ok(profile.clone())
    }

    /// Insert or replace a profile.
    pub fn upsert_profile(&self, mut profile: TableCacheProfile) {
        profile.table = profile.table.to_ascii_lowercase();
        profile.priority = profile.priority.clamp(1, 10);
        info!(table = %profile.table, strategy = %profile.default_strategy, "Table cache profile registered");
        self.profiles.write().insert(profile.table.clone(), profile);
    }

    /// All profiles sorted by table name.
    #[must_use]
    pub fn profiles(&self) -> Vec<TableCacheProfile> {
        let mut all: Vec<_> = self.profiles.read().values().cloned().collect();
        all.sort_by(|a, b| a.table.cmp(&b.table));
        all
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.read().is_empty()
    }
}

impl Default for TablePolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_keyed_uniquely() {
        let registry = TablePolicyRegistry::with_defaults();
        assert_eq!(registry.len(), default_profiles().len());
        assert!(registry.contains("USER"));
        assert_eq!(registry.get("claim").unwrap().data_volatility, DataVolatility::High);
    }

    #[test]
    fn test_update_profile() {
        let registry = TablePolicyRegistry::with_defaults();
        let updated = registry
            .update_profile("claim", |p| {
                p.default_strategy = CacheStrategy::Hybrid;
                p.priority = 42;
            })
            .unwrap();
        assert_eq!(updated.default_strategy, CacheStrategy::Hybrid);
        assert_eq!(updated.priority, 10);
        assert_eq!(registry.get("claim").unwrap().default_strategy, CacheStrategy::Hybrid);
    }

    #[test]
    fn test_update_unknown_table_rejected() {
        let registry = TablePolicyRegistry::empty();
        let err = registry.update_profile("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, RouterError::Validation(_)));
    }

    #[test]
    fn test_upsert_replaces() {
        let registry = TablePolicyRegistry::empty();
        let mut profile = default_profiles().remove(0);
        registry.upsert_profile(profile.clone());
        profile.default_ttl = Duration::from_secs(1);
        registry.upsert_profile(profile);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("user").unwrap().default_ttl, Duration::from_secs(1));
    }

    #[test]
    fn test_profile_serde_ttl_in_seconds() {
        let profile = TablePolicyRegistry::with_defaults().get("menu").unwrap();
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["default_ttl"], 86_400);
        assert_eq!(json["default_strategy"], "LOCAL_FIRST");
        let back: TableCacheProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, profile);
    }
}
