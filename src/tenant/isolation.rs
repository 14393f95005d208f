// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tenant isolation rewriting.
//!
//! Reads and deletes get `<field> = $tenant_id` added to their `WHERE`
//! clause; inserts and creates get the field added to their payload. The
//! rewrite edits each statement at the offsets recorded by
//! [`crate::query::parse`].
//!
//! A statement that already mentions the tenant field anywhere (including
//! inside a string literal) is left alone, which makes the rewrite
//! idempotent.
//!
//! # Example
//!
//! ```
//! use cache_router::tenant::add_tenant_isolation_to_query;
//!
//! let sql = add_tenant_isolation_to_query("SELECT * FROM claim WHERE status = 'open' LIMIT 5", "case_id");
//! assert_eq!(sql, "SELECT * FROM claim WHERE (status = 'open') AND case_id = $tenant_id LIMIT 5");
//! assert_eq!(add_tenant_isolation_to_query(&sql, "case_id"), sql);
//! ```

use regex::Regex;

use crate::query::{parse_statement, statement_spans, Payload, QueryType, Statement};

/// Bind parameter carrying the tenant id.
pub const TENANT_PARAM: &str = "tenant_id";

/// Rewrite every statement of `sql` so it only sees or writes rows of the
/// current tenant. Text between statements (separators, whitespace) is
/// kept as written.
#[must_use]
pub fn add_tenant_isolation_to_query(sql: &str, tenant_field: &str) -> String {
    let mentions = field_pattern(tenant_field);
    let mut out = String::with_capacity(sql.len() + 32);
    let mut copied = 0;
    for span in statement_spans(sql) {
        out.push_str(&sql[copied..span.start]);
        let stmt = parse_statement(&sql[span.clone()]);
        out.push_str(&rewrite_statement(&stmt, tenant_field, mentions.as_ref()));
        copied = span.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn field_pattern(tenant_field: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(tenant_field))).ok()
}

fn rewrite_statement(stmt: &Statement, field: &str, mentions: Option<&Regex>) -> String {
    let text = stmt.text.as_str();
    if stmt.is_trivial() {
        return text.to_string();
    }
    match mentions {
        Some(re) if re.is_match(text) => return text.to_string(),
        None if text.contains(field) => return text.to_string(),
        _ => {}
    }

    match stmt.verb {
        QueryType::Select | QueryType::Update | QueryType::Delete | QueryType::Live => add_condition(stmt, field),
        QueryType::Insert | QueryType::Create | QueryType::Relate => add_to_payload(stmt, field),
        QueryType::Complex => text.to_string(),
    }
}

fn add_condition(stmt: &Statement, field: &str) -> String {
    let text = stmt.text.as_str();
    let predicate = format!("{} = ${}", field, TENANT_PARAM);

    match &stmt.where_span {
        Some(span) => {
            let condition = text[span.clone()].trim();
            let tail = &text[span.end..];
            let joined = if condition.is_empty() {
                predicate
            } else {
                format!("({}) AND {}", condition, predicate)
            };
            format!("{} {}{}{}", &text[..span.start], joined, gap(tail), tail)
        }
        None => {
            let head = text[..stmt.tail_start].trim_end();
            let tail = text[stmt.tail_start..].trim_start();
            format!("{} WHERE {}{}{}", head, predicate, gap(tail), tail)
        }
    }
}

fn add_to_payload(stmt: &Statement, field: &str) -> String {
    let text = stmt.text.as_str();
    match stmt.payload {
        Payload::Object { open, empty } => {
            let entry = if empty {
                format!(" {}: ${} ", field, TENANT_PARAM)
            } else {
                format!(" {}: ${},", field, TENANT_PARAM)
            };
            format!("{}{}{}", &text[..open], entry, &text[open..])
        }
        Payload::SetList { end } => {
            let head = text[..end].trim_end();
            let tail = text[end..].trim_start();
            format!("{}, {} = ${}{}{}", head, field, TENANT_PARAM, gap(tail), tail)
        }
        Payload::ColumnValues { columns_open, values_open } => {
            // Values first so the column offset stays valid.
            let mut out = text.to_string();
            out.insert_str(values_open, &list_entry(text, values_open, &format!("${}", TENANT_PARAM)));
            out.insert_str(columns_open, &list_entry(text, columns_open, field));
            out
        }
        Payload::Absent => format!("{} SET {} = ${}", text.trim_end(), field, TENANT_PARAM),
    }
}

/// `item` followed by a comma unless the parenthesized list at `open` is empty.
fn list_entry(text: &str, open: usize, item: &str) -> String {
    if text[open..].trim_start().starts_with(')') {
        item.to_string()
    } else {
        format!("{}, ", item)
    }
}

fn gap(tail: &str) -> &'static str {
    if tail.is_empty() {
        ""
    } else {
        " "
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iso(sql: &str) -> String {
        add_tenant_isolation_to_query(sql, "case_id")
    }

    #[test]
    fn test_select_without_where() {
        assert_eq!(iso("SELECT * FROM claim"), "SELECT * FROM claim WHERE case_id = $tenant_id");
        assert_eq!(
            iso("SELECT * FROM claim ORDER BY created_at LIMIT 10"),
            "SELECT * FROM claim WHERE case_id = $tenant_id ORDER BY created_at LIMIT 10"
        );
        assert_eq!(
            iso("SELECT count() FROM claim GROUP ALL"),
            "SELECT count() FROM claim WHERE case_id = $tenant_id GROUP ALL"
        );
        assert_eq!(
            iso("SELECT count() FROM claim WHERE status = 'open' GROUP ALL"),
            "SELECT count() FROM claim WHERE (status = 'open') AND case_id = $tenant_id GROUP ALL"
        );
    }

    #[test]
    fn test_existing_condition_parenthesized() {
        assert_eq!(
            iso("SELECT * FROM claim WHERE status = 'open' OR status = 'new'"),
            "SELECT * FROM claim WHERE (status = 'open' OR status = 'new') AND case_id = $tenant_id"
        );
    }

    #[test]
    fn test_update_and_delete() {
        assert_eq!(
            iso("UPDATE claim SET status = 'closed' WHERE id = 'claim:1'"),
            "UPDATE claim SET status = 'closed' WHERE (id = 'claim:1') AND case_id = $tenant_id"
        );
        assert_eq!(
            iso("UPDATE claim SET status = 'closed'"),
            "UPDATE claim SET status = 'closed' WHERE case_id = $tenant_id"
        );
        assert_eq!(iso("DELETE FROM claim"), "DELETE FROM claim WHERE case_id = $tenant_id");
    }

    #[test]
    fn test_insert_payload_shapes() {
        assert_eq!(
            iso("INSERT INTO claim { amount: 5 }"),
            "INSERT INTO claim { case_id: $tenant_id, amount: 5 }"
        );
        assert_eq!(iso("INSERT INTO claim {}"), "INSERT INTO claim { case_id: $tenant_id }");
        assert_eq!(
            iso("CREATE claim SET amount = 5"),
            "CREATE claim SET amount = 5, case_id = $tenant_id"
        );
        assert_eq!(
            iso("INSERT INTO claim (amount, status) VALUES (5, 'open')"),
            "INSERT INTO claim (case_id, amount, status) VALUES ($tenant_id, 5, 'open')"
        );
        assert_eq!(iso("CREATE claim"), "CREATE claim SET case_id = $tenant_id");
    }

    #[test]
    fn test_idempotent() {
        for sql in [
            "SELECT * FROM claim WHERE status = 'open'",
            "INSERT INTO claim { amount: 5 }",
            "UPDATE claim SET status = 'closed'",
            "INSERT INTO claim (amount) VALUES (5)",
        ] {
            let once = iso(sql);
            assert_eq!(iso(&once), once, "{}", sql);
        }
    }

    #[test]
    fn test_existing_field_left_alone() {
        let sql = "SELECT * FROM claim WHERE case_id = 'c9'";
        assert_eq!(iso(sql), sql);
    }

    #[test]
    fn test_multi_statement_and_trivial() {
        assert_eq!(
            iso("BEGIN TRANSACTION; SELECT * FROM claim; COMMIT TRANSACTION"),
            "BEGIN TRANSACTION; SELECT * FROM claim WHERE case_id = $tenant_id; COMMIT TRANSACTION"
        );
        assert_eq!(iso("FOO bar"), "FOO bar");
        assert_eq!(
            iso("BEGIN;\nDELETE FROM claim;\nCOMMIT;"),
            "BEGIN;\nDELETE FROM claim WHERE case_id = $tenant_id;\nCOMMIT;"
        );
    }

    #[test]
    fn test_semicolon_in_literal_preserved() {
        assert_eq!(
            iso("INSERT INTO claim { note: 'a;b' }"),
            "INSERT INTO claim { case_id: $tenant_id, note: 'a;b' }"
        );
        assert_eq!(
            iso("UPDATE claim SET note = 'x; y' WHERE id = 'claim:1'; SELECT * FROM claim"),
            "UPDATE claim SET note = 'x; y' WHERE (id = 'claim:1') AND case_id = $tenant_id; \
             SELECT * FROM claim WHERE case_id = $tenant_id"
        );
    }

    #[test]
    fn test_literal_mention_counts_as_present() {
        // Textual detection: a literal naming the field suppresses the rewrite.
        let sql = "SELECT * FROM note WHERE body = 'see case_id'";
        assert_eq!(iso(sql), sql);
    }
}
