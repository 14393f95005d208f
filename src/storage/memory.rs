// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory store implementing both the remote and local contracts.
//!
//! Used for tests, demos and as an embedded local store when no durable
//! backend is configured. Statement support is deliberately small: `SELECT`
//! over one table with `AND`-joined equality predicates and `LIMIT`, writes
//! with `{ k: v }`, `SET k = v` or `(cols) VALUES (vals)` payloads, and
//! `DELETE` with equality predicates. Anything else yields an empty result.
//!
//! An outage can be simulated with [`InMemoryStore::set_available`] and
//! slow backends with [`InMemoryStore::set_latency`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};

use super::traits::{
    CacheKey, CachedData, DataStore, LocalStore, Params, RemoteService, ResultSet, StorageError,
};
use crate::query::{parse, Payload, QueryType, Statement};

static AND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+AND\s+").expect("valid regex"));
static EQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?\s*([A-Za-z_][A-Za-z0-9_.]*)\s*=\s*(.+?)\s*\)?$").expect("valid regex"));
static LIMIT_N_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").expect("valid regex"));
static SET_LIST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSET\b").expect("valid regex"));
static SET_END_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(WHERE|RETURN|TIMEOUT)\b").expect("valid regex"));

pub struct InMemoryStore {
    tables: DashMap<String, Vec<Value>>,
    cache: DashMap<CacheKey, CachedData>,
    available: AtomicBool,
    latency: Mutex<Duration>,
    next_id: AtomicU64,
    query_count: AtomicU64,
    connect_attempts: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            cache: DashMap::new(),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1),
            query_count: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
        }
    }

    /// Seed rows directly, bypassing statements.
    pub fn insert_rows(&self, table: &str, rows: Vec<Value>) {
        let mut entry = self.tables.entry(table.to_ascii_lowercase()).or_default();
        for row in rows {
            let row = self.with_id(table, row);
            entry.push(row);
        }
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .get(&table.to_ascii_lowercase())
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Statements executed through [`DataStore::query`].
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Remove all rows and cache entries.
    pub fn clear(&self) {
        self.tables.clear();
        self.cache.clear();
    }

    async fn gate(&self) -> Result<(), StorageError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory store offline".into()))
        }
    }

    fn with_id(&self, table: &str, mut row: Value) -> Value {
        if let Value::Object(ref mut map) = row {
            if !map.contains_key("id") {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                map.insert("id".into(), Value::String(format!("{}:{}", table.to_ascii_lowercase(), n)));
            }
        }
        row
    }

    fn execute(&self, stmt: &Statement, params: &Params) -> ResultSet {
        let Some(table) = stmt.tables.first().cloned() else {
            return Vec::new();
        };
        let predicates = stmt.condition().map(|c| parse_predicates(c, params)).unwrap_or_default();

        match stmt.verb {
            QueryType::Select | QueryType::Live => {
                let rows = self.rows(&table);
                let limit = LIMIT_N_RE
                    .captures(&stmt.text)
                    .and_then(|c| c[1].parse::<usize>().ok())
                    .unwrap_or(usize::MAX);
                rows.into_iter()
                    .filter(|row| matches_all(row, &predicates))
                    .take(limit)
                    .collect()
            }
            QueryType::Insert | QueryType::Create | QueryType::Relate => {
                let record = self.with_id(&table, Value::Object(payload_fields(stmt, params)));
                self.tables.entry(table).or_default().push(record.clone());
                vec![record]
            }
            QueryType::Update => {
                let fields = set_fields(&stmt.text, params);
                let mut updated = Vec::new();
                if let Some(mut rows) = self.tables.get_mut(&table) {
                    for row in rows.iter_mut().filter(|r| matches_all(r, &predicates)) {
                        if let Value::Object(map) = &mut *row {
                            for (k, v) in &fields {
                                map.insert(k.clone(), v.clone());
                            }
                        }
                        updated.push(row.clone());
                    }
                }
                updated
            }
            QueryType::Delete => {
                let mut removed = Vec::new();
                if let Some(mut rows) = self.tables.get_mut(&table) {
                    rows.retain(|row| {
                        if matches_all(row, &predicates) {
                            removed.push(row.clone());
                            false
                        } else {
                            true
                        }
                    });
                }
                removed
            }
            QueryType::Complex => Vec::new(),
        }
    }

    fn upsert_rows(&self, table: &str, rows: &[Value]) {
        let mut entry = self.tables.entry(table.to_string()).or_default();
        for row in rows {
            match row.get("id") {
                Some(id) => {
                    if let Some(existing) = entry.iter_mut().find(|r| r.get("id") == Some(id)) {
                        *existing = row.clone();
                    } else {
                        entry.push(row.clone());
                    }
                }
                None if !entry.contains(row) => entry.push(row.clone()),
                None => {}
            }
        }
    }

    /// Remove the rows `entry` brought into `key.table`, except those another
    /// cache entry of the same table still holds.
    fn drop_cached_rows(&self, key: &CacheKey, entry: &CachedData) {
        let held: Vec<Value> = self
            .cache
            .iter()
            .filter(|e| e.key() != key && e.key().table == key.table)
            .flat_map(|e| e.value().data.clone())
            .collect();
        if let Some(mut rows) = self.tables.get_mut(&key.table) {
            rows.retain(|row| !entry.data.contains(row) || held.contains(row));
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_predicates(condition: &str, params: &Params) -> Vec<(String, Value)> {
    AND_RE
        .split(condition)
        .filter_map(|term| {
            let caps = EQ_RE.captures(term.trim())?;
            let value = literal_value(caps[2].trim(), params)?;
            Some((caps[1].to_string(), value))
        })
        .collect()
}

fn matches_all(row: &Value, predicates: &[(String, Value)]) -> bool {
    predicates.iter().all(|(field, expected)| row.get(field) == Some(expected))
}

/// `$param`, quoted string, number, bool or null.
fn literal_value(raw: &str, params: &Params) -> Option<Value> {
    let raw = raw.trim().trim_end_matches(')').trim();
    if let Some(name) = raw.strip_prefix('$') {
        return params.get(name).cloned();
    }
    if raw.len() >= 2 && ((raw.starts_with('\'') && raw.ends_with('\'')) || (raw.starts_with('"') && raw.ends_with('"'))) {
        return Some(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    match raw {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" | "NONE" => return Some(Value::Null),
        _ => {}
    }
    serde_json::from_str::<serde_json::Number>(raw).ok().map(Value::Number)
}

/// Split on commas outside quotes and brackets.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn assignments(list: &str, separator: char, params: &Params) -> Map<String, Value> {
    split_top_level(list)
        .into_iter()
        .filter_map(|pair| {
            let (k, v) = pair.split_once(separator)?;
            let key = k.trim().trim_matches('"').to_string();
            Some((key, literal_value(v, params)?))
        })
        .collect()
}

fn set_fields(text: &str, params: &Params) -> Map<String, Value> {
    let Some(set) = SET_LIST_RE.find(text) else {
        return Map::new();
    };
    let rest = &text[set.end()..];
    let end = SET_END_RE.find(rest).map(|m| m.start()).unwrap_or(rest.len());
    assignments(&rest[..end], '=', params)
}

fn payload_fields(stmt: &Statement, params: &Params) -> Map<String, Value> {
    match &stmt.payload {
        Payload::Object { open, .. } => {
            let body = &stmt.text[*open..];
            let close = body.rfind('}').unwrap_or(body.len());
            assignments(&body[..close], ':', params)
        }
        Payload::SetList { .. } => set_fields(&stmt.text, params),
        Payload::ColumnValues { columns_open, values_open } => {
            let cols = &stmt.text[*columns_open..];
            let cols = &cols[..cols.find(')').unwrap_or(cols.len())];
            let vals = &stmt.text[*values_open..];
            let vals = &vals[..vals.rfind(')').unwrap_or(vals.len())];
            split_top_level(cols)
                .into_iter()
                .zip(split_top_level(vals))
                .filter_map(|(c, v)| Some((c.to_string(), literal_value(v, params)?)))
                .collect()
        }
        Payload::Absent => Map::new(),
    }
}

fn split_thing(thing: &str) -> (String, Option<String>) {
    match thing.split_once(':') {
        Some((table, _)) => (table.to_ascii_lowercase(), Some(thing.to_string())),
        None => (thing.to_ascii_lowercase(), None),
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn query(&self, statement: &str, params: &Params) -> Result<Vec<ResultSet>, StorageError> {
        self.gate().await?;
        self.query_count.fetch_add(1, Ordering::SeqCst);
        Ok(parse(statement).iter().map(|stmt| self.execute(stmt, params)).collect())
    }

    async fn select(&self, thing: &str) -> Result<Vec<Value>, StorageError> {
        self.gate().await?;
        let (table, id) = split_thing(thing);
        let rows = self.rows(&table);
        Ok(match id {
            Some(id) => rows.into_iter().filter(|r| r.get("id") == Some(&Value::String(id.clone()))).collect(),
            None => rows,
        })
    }

    async fn create(&self, thing: &str, data: Value) -> Result<Value, StorageError> {
        self.gate().await?;
        let (table, id) = split_thing(thing);
        let mut record = data;
        if let (Some(id), Value::Object(map)) = (id, &mut record) {
            map.insert("id".into(), Value::String(id));
        }
        let record = self.with_id(&table, record);
        self.tables.entry(table).or_default().push(record.clone());
        Ok(record)
    }

    async fn update(&self, thing: &str, data: Value) -> Result<Value, StorageError> {
        self.gate().await?;
        let (table, id) = split_thing(thing);
        let id = id.ok_or_else(|| StorageError::Backend(format!("update requires a record id, got '{}'", thing)))?;
        let mut rows = self
            .tables
            .get_mut(&table)
            .ok_or_else(|| StorageError::NotFound(thing.to_string()))?;
        let row = rows
            .iter_mut()
            .find(|r| r.get("id") == Some(&Value::String(id.clone())))
            .ok_or_else(|| StorageError::NotFound(thing.to_string()))?;
        let mut replacement = data;
        if let Value::Object(map) = &mut replacement {
            map.insert("id".into(), Value::String(id));
        }
        *row = replacement.clone();
        Ok(replacement)
    }

    async fn merge(&self, thing: &str, data: Value) -> Result<Value, StorageError> {
        self.gate().await?;
        let (table, id) = split_thing(thing);
        let id = id.ok_or_else(|| StorageError::Backend(format!("merge requires a record id, got '{}'", thing)))?;
        let mut rows = self
            .tables
            .get_mut(&table)
            .ok_or_else(|| StorageError::NotFound(thing.to_string()))?;
        let row = rows
            .iter_mut()
            .find(|r| r.get("id") == Some(&Value::String(id.clone())))
            .ok_or_else(|| StorageError::NotFound(thing.to_string()))?;
        if let (Value::Object(target), Value::Object(patch)) = (&mut *row, data) {
            for (k, v) in patch {
                if k != "id" {
                    target.insert(k, v);
                }
            }
        }
        Ok(row.clone())
    }

    async fn delete(&self, thing: &str) -> Result<Option<Value>, StorageError> {
        self.gate().await?;
        let (table, id) = split_thing(thing);
        let Some(mut rows) = self.tables.get_mut(&table) else {
            return Ok(None);
        };
        match id {
            Some(id) => {
                let pos = rows.iter().position(|r| r.get("id") == Some(&Value::String(id.clone())));
                Ok(pos.map(|p| rows.remove(p)))
            }
            None => {
                rows.clear();
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RemoteService for InMemoryStore {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.gate().await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.gate().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn get_cache(&self, key: &CacheKey) -> Result<Option<CachedData>, StorageError> {
        self.gate().await?;
        Ok(self.cache.get(key).map(|r| r.value().clone()))
    }

    async fn put_cache(&self, key: &CacheKey, entry: CachedData) -> Result<(), StorageError> {
        self.gate().await?;
        if let Some(previous) = self.cache.get(key).map(|r| r.value().clone()) {
            self.drop_cached_rows(key, &previous);
        }
        self.upsert_rows(&key.table, &entry.data);
        self.cache.insert(key.clone(), entry);
        Ok(())
    }

    async fn remove_cache(&self, key: &CacheKey) -> Result<(), StorageError> {
        self.gate().await?;
        if let Some((key, entry)) = self.cache.remove(key) {
            self.drop_cached_rows(&key, &entry);
        }
        Ok(())
    }

    async fn remove_cache_scope(&self, user_id: Option<&str>, case_id: Option<&str>) -> Result<usize, StorageError> {
        self.gate().await?;
        let keys: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|e| e.key().in_scope(user_id, case_id))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            if let Some((key, entry)) = self.cache.remove(key) {
                self.drop_cached_rows(&key, &entry);
            }
        }
        Ok(keys.len())
    }

    async fn cache_keys(&self) -> Result<Vec<CacheKey>, StorageError> {
        self.gate().await?;
        Ok(self.cache.iter().map(|e| e.key().clone()).collect())
    }
}
