// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator contracts: the remote data service and the embedded local
//! store. Both share the [`DataStore`] query surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Named statement parameters (`$name` → value).
pub type Params = Map<String, Value>;

/// Rows returned by one statement.
pub type ResultSet = Vec<Value>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Cache table key: one entry per (table, user, case).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub table: String,
    pub user_id: Option<String>,
    pub case_id: Option<String>,
}

impl CacheKey {
    #[must_use]
    pub fn new(table: impl Into<String>, user_id: Option<&str>, case_id: Option<&str>) -> Self {
        Self {
            table: table.into().to_ascii_lowercase(),
            user_id: user_id.map(str::to_string),
            case_id: case_id.map(str::to_string),
        }
    }

    /// Whether the key belongs to the given user/case scope. `None` in the
    /// scope matches any value.
    #[must_use]
    pub fn in_scope(&self, user_id: Option<&str>, case_id: Option<&str>) -> bool {
        user_id.map_or(true, |u| self.user_id.as_deref() == Some(u))
            && case_id.map_or(true, |c| self.case_id.as_deref() == Some(c))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.table,
            self.user_id.as_deref().unwrap_or("*"),
            self.case_id.as_deref().unwrap_or("*")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// TTL above one hour.
    Persistent,
    Temporary,
}

/// Cache table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedData {
    pub data: Vec<Value>,
    /// Epoch millis of the last sync from remote.
    pub sync_timestamp: u64,
    pub expires_at: Option<u64>,
    pub cache_type: CacheType,
}

impl CachedData {
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

/// Shared query surface of remote and local stores.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Run one or more `;`-separated statements; one result set per
    /// statement, in order.
    async fn query(&self, statement: &str, params: &Params) -> Result<Vec<ResultSet>, StorageError>;

    /// `thing` is a table (`claim`) or a record id (`claim:42`).
    async fn select(&self, thing: &str) -> Result<Vec<Value>, StorageError>;
    async fn create(&self, thing: &str, data: Value) -> Result<Value, StorageError>;
    async fn update(&self, thing: &str, data: Value) -> Result<Value, StorageError>;
    async fn merge(&self, thing: &str, data: Value) -> Result<Value, StorageError>;
    async fn delete(&self, thing: &str) -> Result<Option<Value>, StorageError>;
}

/// Remote data service. The only place mutations succeed.
#[async_trait]
pub trait RemoteService: DataStore {
    async fn connect(&self) -> Result<(), StorageError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

/// Embedded local store with the durable cache table.
#[async_trait]
pub trait LocalStore: DataStore {
    async fn get_cache(&self, key: &CacheKey) -> Result<Option<CachedData>, StorageError>;
    async fn put_cache(&self, key: &CacheKey, entry: CachedData) -> Result<(), StorageError>;
    async fn remove_cache(&self, key: &CacheKey) -> Result<(), StorageError>;

    /// Drop every cache entry in scope; returns the number removed.
    async fn remove_cache_scope(&self, user_id: Option<&str>, case_id: Option<&str>) -> Result<usize, StorageError>;

    async fn cache_keys(&self) -> Result<Vec<CacheKey>, StorageError>;
}
