// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query analyzer: structural features plus a runtime frequency signal.

use std::num::NonZeroUsize;

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::trace;

use super::{parse, QueryType, Statement};

/// Marker for "the currently authenticated identity".
pub const CURRENT_IDENTITY_MARKER: &str = "$auth";

/// Identity, permission and menu tables. Queries touching these are served
/// local-first.
pub const PERSONAL_DATA_TABLES: &[&str] = &[
    "user",
    "user_profile",
    "role",
    "permission",
    "user_role",
    "role_permission",
    "menu",
    "menu_item",
    "user_preference",
    "user_settings",
];

/// High-cardinality domain tables.
pub const LARGE_TABLES: &[&str] = &["claim", "case", "document", "audit_log", "notification", "message", "event"];

/// Observations after which the frequency score saturates.
const FREQUENCY_SATURATION: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSize {
    Small,
    Medium,
    Large,
}

/// Structural features of one query. Derived per call, never mutated.
#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    pub query_type: QueryType,
    pub tables: Vec<String>,
    pub has_conditions: bool,
    pub has_joins: bool,
    pub has_aggregations: bool,
    pub is_simple_select: bool,
    pub is_personal_data_query: bool,
    pub estimated_result_size: ResultSize,
    /// `min(ln(seen + 1) / ln(100), 1)`
    pub frequency_score: f64,
    /// Hash of the normalized statement text.
    pub query_hash: String,
    pub statements: Vec<Statement>,
}

impl QueryAnalysis {
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self.query_type, QueryType::Select | QueryType::Live)
    }
}

static STRING_LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#).expect("valid regex"));
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(\.\d+)?\b").expect("valid regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Collapse whitespace, lower-case, and replace literals with `?`.
#[must_use]
pub fn normalize_query(sql: &str) -> String {
    let without_strings = STRING_LITERAL_RE.replace_all(sql, "?");
    let without_numbers = NUMBER_RE.replace_all(&without_strings, "?");
    WHITESPACE_RE
        .replace_all(without_numbers.trim(), " ")
        .to_lowercase()
}

/// Stable short hash of the normalized statement.
#[must_use]
pub fn query_hash(sql: &str) -> String {
    let digest = Sha256::digest(normalize_query(sql).as_bytes());
    hex::encode(&digest[..16])
}

/// `min(ln(seen + 1) / ln(100), 1)`
#[must_use]
pub fn frequency_score(seen: u64) -> f64 {
    ((seen as f64 + 1.0).ln() / FREQUENCY_SATURATION.ln()).min(1.0)
}

/// Parses queries and tracks how often each normalized query is seen.
///
/// The counter map is bounded; the least recently seen query is evicted
/// when full, which resets its score.
pub struct QueryAnalyzer {
    frequency: Mutex<LruCache<String, u64>>,
}

impl QueryAnalyzer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            frequency: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Analyze a query and count one observation of it.
    pub fn analyze(&self, sql: &str, _params: Option<&Map<String, Value>>) -> QueryAnalysis {
        let statements = parse(sql);
        let hash = query_hash(sql);
        let seen = self.observe(&hash);
        let analysis = analyze_statements(statements, hash, frequency_score(seen));
        trace!(
            query_type = %analysis.query_type,
            tables = ?analysis.tables,
            frequency = analysis.frequency_score,
            "Analyzed query"
        );
        analysis
    }

    /// Times the query has been seen, including this call.
    fn observe(&self, hash: &str) -> u64 {
        let mut frequency = self.frequency.lock();
        match frequency.get_mut(hash) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                frequency.put(hash.to_string(), 1);
                1
            }
        }
    }

    /// Times a query has been seen without counting a new observation.
    #[must_use]
    pub fn seen_count(&self, sql: &str) -> u64 {
        self.frequency.lock().peek(&query_hash(sql)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn tracked_queries(&self) -> usize {
        self.frequency.lock().len()
    }
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Derive features from parsed statements with a given frequency score.
#[must_use]
pub fn analyze_statements(statements: Vec<Statement>, query_hash: String, frequency_score: f64) -> QueryAnalysis {
    let query_type = dominant_verb(&statements);

    let mut tables: Vec<String> = Vec::new();
    for table in statements.iter().flat_map(|s| s.tables.iter()) {
        if !tables.contains(table) {
            tables.push(table.clone());
        }
    }

    let has_conditions = statements.iter().any(|s| s.where_span.is_some());
    let has_joins = statements.iter().any(|s| s.has_joins);
    let has_aggregations = statements.iter().any(|s| s.has_aggregations);
    let has_limit = statements.iter().any(|s| s.has_limit);
    let has_subquery = statements.iter().any(|s| s.has_subquery);
    let non_trivial = statements.iter().filter(|s| !s.is_trivial()).count();

    let is_simple_select = query_type == QueryType::Select
        && non_trivial == 1
        && tables.len() == 1
        && !has_joins
        && !has_aggregations
        && !has_subquery;

    let is_personal_data_query = statements.iter().any(|s| s.text.contains(CURRENT_IDENTITY_MARKER))
        || tables.iter().any(|t| PERSONAL_DATA_TABLES.contains(&t.as_str()));

    let estimated_result_size = if has_limit {
        ResultSize::Small
    } else if tables.iter().any(|t| LARGE_TABLES.contains(&t.as_str())) {
        ResultSize::Large
    } else {
        ResultSize::Medium
    };

    QueryAnalysis {
        query_type,
        tables,
        has_conditions,
        has_joins,
        has_aggregations,
        is_simple_select,
        is_personal_data_query,
        estimated_result_size,
        frequency_score,
        query_hash,
        statements,
    }
}

/// The first write verb if any statement writes, else the first
/// non-trivial verb, else `Complex`.
fn dominant_verb(statements: &[Statement]) -> QueryType {
    statements
        .iter()
        .filter_map(|s| s.verb_kind)
        .find(QueryType::is_write)
        .or_else(|| statements.iter().find_map(|s| s.verb_kind))
        .unwrap_or(QueryType::Complex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_score_curve() {
        assert_eq!(frequency_score(0), 0.0);
        assert!((frequency_score(9) - 0.5).abs() < 1e-9);
        assert!(frequency_score(98) < 1.0);
        assert_eq!(frequency_score(99), 1.0);
        assert_eq!(frequency_score(10_000), 1.0);
    }

    #[test]
    fn test_frequency_counter_increments() {
        let analyzer = QueryAnalyzer::new(16);
        let first = analyzer.analyze("SELECT * FROM claim WHERE id = 1", None);
        let second = analyzer.analyze("select *   from claim where id = 2", None);
        assert!(second.frequency_score > first.frequency_score);
        assert_eq!(first.query_hash, second.query_hash);
        assert_eq!(analyzer.seen_count("SELECT * FROM claim WHERE id = 3"), 2);
    }

    #[test]
    fn test_frequency_counter_is_bounded() {
        let analyzer = QueryAnalyzer::new(2);
        analyzer.analyze("SELECT * FROM a", None);
        analyzer.analyze("SELECT * FROM b", None);
        analyzer.analyze("SELECT * FROM c", None);
        assert_eq!(analyzer.tracked_queries(), 2);
        assert_eq!(analyzer.seen_count("SELECT * FROM a"), 0);
    }

    #[test]
    fn test_normalize_replaces_literals() {
        assert_eq!(
            normalize_query("SELECT *  FROM claim\nWHERE name = 'Bob' AND n = 42"),
            "select * from claim where name = ? and n = ?"
        );
    }

    #[test]
    fn test_personal_data_detection() {
        let analyzer = QueryAnalyzer::default();
        assert!(analyzer.analyze("SELECT * FROM user", None).is_personal_data_query);
        assert!(analyzer.analyze("SELECT * FROM claim WHERE owner = $auth.id", None).is_personal_data_query);
        assert!(!analyzer.analyze("SELECT * FROM claim", None).is_personal_data_query);
    }

    #[test]
    fn test_result_size_estimate() {
        let analyzer = QueryAnalyzer::default();
        assert_eq!(analyzer.analyze("SELECT * FROM claim LIMIT 5", None).estimated_result_size, ResultSize::Small);
        assert_eq!(analyzer.analyze("SELECT * FROM claim", None).estimated_result_size, ResultSize::Large);
        assert_eq!(analyzer.analyze("SELECT * FROM lookup", None).estimated_result_size, ResultSize::Medium);
    }

    #[test]
    fn test_simple_select_and_features() {
        let analyzer = QueryAnalyzer::default();
        let a = analyzer.analyze("SELECT * FROM claim WHERE status = 'open'", None);
        assert!(a.is_simple_select);
        assert!(a.has_conditions);

        let a = analyzer.analyze("SELECT * FROM claim JOIN document ON document.claim = claim.id", None);
        assert!(!a.is_simple_select);
        assert!(a.has_joins);

        let a = analyzer.analyze("SELECT count() FROM claim GROUP ALL", None);
        assert!(!a.is_simple_select);
        assert!(a.has_aggregations);
    }

    #[test]
    fn test_write_verb_dominates_multi_statement() {
        let analyzer = QueryAnalyzer::default();
        let a = analyzer.analyze("BEGIN; SELECT * FROM claim; UPDATE claim SET x = 1; COMMIT", None);
        assert_eq!(a.query_type, QueryType::Update);

        // A leading read does not make a batch with a write cacheable
        let a = analyzer.analyze("SELECT * FROM user; UPDATE claim SET x = 1", None);
        assert_eq!(a.query_type, QueryType::Update);
        assert!(a.query_type.is_write());
        assert!(!a.is_simple_select);

        let a = analyzer.analyze("LET $x = 1; SELECT * FROM claim", None);
        assert_eq!(a.query_type, QueryType::Select);

        let a = analyzer.analyze("BEGIN; COMMIT", None);
        assert_eq!(a.query_type, QueryType::Complex);
    }
}
