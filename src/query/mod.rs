// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query intent parsing.
//!
//! Statements are interpreted once into a [`Statement`]: the verb, the
//! tables it touches, the span of its `WHERE` condition and the shape of its
//! write payload. The analyzer derives [`QueryAnalysis`] from these and the
//! tenant rewriter edits the statement text at the recorded offsets, so the
//! same text is never interpreted twice.
//!
//! Interpretation is textual (keyword patterns, not a grammar). Keywords
//! and table-like words inside string literals or comments are picked up as
//! if they were code.
//!
//! # Example
//!
//! ```
//! use cache_router::query::{parse, QueryType};
//!
//! let stmts = parse("SELECT * FROM claim WHERE status = 'open' LIMIT 10");
//! assert_eq!(stmts.len(), 1);
//! assert_eq!(stmts[0].verb, QueryType::Select);
//! assert_eq!(stmts[0].tables, vec!["claim".to_string()]);
//! assert!(stmts[0].where_span.is_some());
//! assert!(stmts[0].has_limit);
//! ```

pub mod analyzer;

pub use analyzer::{QueryAnalysis, QueryAnalyzer, ResultSize};

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Statement verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Live,
    Create,
    Relate,
    Complex,
}

impl QueryType {
    /// Verbs that change data.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Create | Self::Relate)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Live => "LIVE",
            Self::Create => "CREATE",
            Self::Relate => "RELATE",
            Self::Complex => "COMPLEX",
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a write statement carries its field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `{ ... }` object literal; offset just past the opening brace.
    Object { open: usize, empty: bool },
    /// `SET a = 1, b = 2`; offset where the list ends.
    SetList { end: usize },
    /// `(cols) VALUES (vals)`; offsets just past each opening paren.
    ColumnValues { columns_open: usize, values_open: usize },
    /// No recognizable payload.
    Absent,
}

/// One parsed statement.
#[derive(Debug, Clone)]
pub struct Statement {
    pub text: String,
    /// `None` for transaction control and variable statements.
    pub verb_kind: Option<QueryType>,
    pub verb: QueryType,
    pub tables: Vec<String>,
    /// Condition text after `WHERE`, up to the first trailing clause.
    pub where_span: Option<Range<usize>>,
    /// Offset where a `WHERE` clause would be inserted.
    pub tail_start: usize,
    pub payload: Payload,
    pub has_limit: bool,
    pub has_joins: bool,
    pub has_aggregations: bool,
    pub has_subquery: bool,
}

impl Statement {
    /// Transaction control, `LET`, `USE`, `RETURN` and empty statements.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.verb_kind.is_none()
    }

    #[must_use]
    pub fn condition(&self) -> Option<&str> {
        self.where_span.as_ref().map(|r| self.text[r.clone()].trim())
    }
}

const TRIVIAL_VERBS: &[&str] = &["BEGIN", "COMMIT", "CANCEL", "LET", "USE", "RETURN", "INFO", "DEFINE", "REMOVE"];

static TABLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bFROM\s+([A-Za-z_][A-Za-z0-9_]*(?:\s*,\s*[A-Za-z_][A-Za-z0-9_]*)*)",
        r"(?i)\bINSERT\s+INTO\s+([A-Za-z_][A-Za-z0-9_]*)",
        r"(?i)\b(?:UPDATE|UPSERT)\s+([A-Za-z_][A-Za-z0-9_]*)",
        r"(?i)\bDELETE\s+(?:FROM\s+)?([A-Za-z_][A-Za-z0-9_]*)",
        r"(?i)\bCREATE\s+([A-Za-z_][A-Za-z0-9_]*)",
        r"(?i)\bJOIN\s+([A-Za-z_][A-Za-z0-9_]*)",
        r"(?i)\bRELATE\s+\S+?->([A-Za-z_][A-Za-z0-9_]*)->",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static WHERE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid regex"));

static TRAILING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(GROUP\s+BY|GROUP\s+ALL|ORDER\s+BY|LIMIT|START\s+AT|START|FETCH|SPLIT|TIMEOUT|PARALLEL|RETURN|EXPLAIN)\b")
        .expect("valid regex")
});

static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\b").expect("valid regex"));
static JOIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bJOIN\b").expect("valid regex"));
static AGG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(count|sum|avg|min|max)\s*\(|\bGROUP\s+(BY|ALL)\b|\bmath::").expect("valid regex")
});
static SUBQUERY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\(\s*SELECT\b").expect("valid regex"));
static SET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSET\b").expect("valid regex"));
static VALUES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bVALUES\s*\(").expect("valid regex"));
static INSERT_COLS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bINSERT\s+INTO\s+[A-Za-z_][A-Za-z0-9_]*\s*\(").expect("valid regex"));

/// SQL keywords a comma-separated `FROM` list can run into.
const NOT_TABLES: &[&str] = &["where", "select", "only", "value", "group", "order", "limit", "fetch"];

/// Split a multi-statement string on `;` and parse each non-empty part.
#[must_use]
pub fn parse(sql: &str) -> Vec<Statement> {
    statement_spans(sql)
        .into_iter()
        .map(|span| parse_statement(&sql[span]))
        .collect()
}

/// Byte ranges of the non-empty, trimmed statements of `sql`. A `;` inside
/// a quoted string is not a separator.
#[must_use]
pub fn statement_spans(sql: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in sql.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            None if c == ';' => {
                push_trimmed(&mut spans, sql, start..i);
                start = i + 1;
            }
            None => {}
        }
    }
    push_trimmed(&mut spans, sql, start..sql.len());
    spans
}

fn push_trimmed(spans: &mut Vec<Range<usize>>, sql: &str, range: Range<usize>) {
    let piece = &sql[range.clone()];
    let lead = piece.len() - piece.trim_start().len();
    let trail = piece.len() - piece.trim_end().len();
    if lead + trail < piece.len() {
        spans.push(range.start + lead..range.end - trail);
    }
}

/// Parse a single statement (no `;` splitting).
#[must_use]
pub fn parse_statement(text: &str) -> Statement {
    let text = text.trim().to_string();
    let verb_kind = extract_verb(&text);
    let verb = verb_kind.unwrap_or(QueryType::Complex);
    let tables = extract_tables(&text);

    let where_match = WHERE_RE.find(&text);
    let where_span = where_match.map(|m| {
        let end = TRAILING_RE
            .find_at(&text, m.end())
            .map(|t| t.start())
            .unwrap_or(text.len());
        m.end()..end.max(m.end())
    });

    let tail_start = tail_offset(&text, verb);
    let payload = match verb {
        QueryType::Insert | QueryType::Create | QueryType::Relate => detect_payload(&text),
        _ => Payload::Absent,
    };

    Statement {
        has_limit: LIMIT_RE.is_match(&text),
        has_joins: JOIN_RE.is_match(&text),
        has_aggregations: AGG_RE.is_match(&text),
        has_subquery: SUBQUERY_RE.is_match(&text),
        text,
        verb_kind,
        verb,
        tables,
        where_span,
        tail_start,
        payload,
    }
}

fn extract_verb(text: &str) -> Option<QueryType> {
    let first = text
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|w| !w.is_empty())?
        .to_ascii_uppercase();

    if TRIVIAL_VERBS.contains(&first.as_str()) {
        return None;
    }
    Some(match first.as_str() {
        "SELECT" => QueryType::Select,
        "INSERT" => QueryType::Insert,
        "UPDATE" | "UPSERT" => QueryType::Update,
        "DELETE" => QueryType::Delete,
        "LIVE" => QueryType::Live,
        "CREATE" => QueryType::Create,
        "RELATE" => QueryType::Relate,
        _ => QueryType::Complex,
    })
}

/// Every table-like identifier referenced by the statement, lower-cased.
#[must_use]
pub fn extract_tables(text: &str) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    for re in TABLE_PATTERNS.iter() {
        for caps in re.captures_iter(text) {
            let Some(list) = caps.get(1) else { continue };
            for name in list.as_str().split(',') {
                let name = name.trim().to_ascii_lowercase();
                if name.is_empty() || NOT_TABLES.contains(&name.as_str()) {
                    continue;
                }
                if !tables.contains(&name) {
                    tables.push(name);
                }
            }
        }
    }
    tables
}

/// Offset at which a new `WHERE` clause goes: before the first trailing
/// clause that follows the statement's table reference, or at the end.
fn tail_offset(text: &str, verb: QueryType) -> usize {
    let anchor = match verb {
        QueryType::Update => SET_RE.find(text).map(|m| m.end()),
        _ => TABLE_PATTERNS.first().and_then(|re| re.find(text)).map(|m| m.end()),
    }
    .unwrap_or(0);

    TRAILING_RE
        .find_at(text, anchor)
        .map(|m| m.start())
        .unwrap_or(text.len())
}

fn detect_payload(text: &str) -> Payload {
    if let Some(open) = text.find('{') {
        let empty = text[open + 1..].trim_start().starts_with('}');
        return Payload::Object { open: open + 1, empty };
    }
    if SET_RE.is_match(text) {
        let end = SET_RE
            .find(text)
            .and_then(|m| TRAILING_RE.find_at(text, m.end()).map(|t| t.start()))
            .or_else(|| WHERE_RE.find(text).map(|m| m.start()))
            .unwrap_or(text.len());
        return Payload::SetList { end };
    }
    if let (Some(cols), Some(vals)) = (INSERT_COLS_RE.find(text), VALUES_RE.find(text)) {
        return Payload::ColumnValues {
            columns_open: cols.end(),
            values_open: vals.end(),
        };
    }
    Payload::Absent
}
