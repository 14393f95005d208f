// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the router.
//!
//! Every failure surfaced by the router is a [`RouterError`]. Collaborator
//! failures arrive as [`StorageError`] and are classified into an
//! [`ErrorCategory`] by inspecting their message, the same way the rest of
//! the crate buckets errors for metrics and severity escalation.
//!
//! # Example
//!
//! ```
//! use cache_router::error::{ErrorCategory, ErrorTracker, ErrorSeverity};
//!
//! assert_eq!(ErrorCategory::classify("connection refused"), ErrorCategory::Connection);
//! assert_eq!(ErrorCategory::classify("operation timed out"), ErrorCategory::Timeout);
//!
//! let tracker = ErrorTracker::new();
//! assert_eq!(tracker.record(ErrorCategory::Query), ErrorSeverity::Low);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::storage::traits::StorageError;

pub type Result<T> = std::result::Result<T, RouterError>;

/// Error classes used for propagation policy, metrics and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Query,
    Cache,
    Sync,
    Validation,
    Permission,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    /// Classify an error by the keywords in its message.
    ///
    /// Order matters: a "connection timed out" is a timeout first.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| msg.contains(w));

        if has(&["timeout", "timed out", "deadline"]) {
            Self::Timeout
        } else if has(&["permission", "denied", "forbidden", "unauthorized", "not allowed"]) {
            Self::Permission
        } else if has(&["connect", "network", "socket", "unreachable", "offline", "disconnected"]) {
            Self::Connection
        } else if has(&["invalid", "validation", "required", "malformed"]) {
            Self::Validation
        } else if has(&["cache"]) {
            Self::Cache
        } else if has(&["sync", "subscription", "live query"]) {
            Self::Sync
        } else if has(&["query", "parse", "syntax", "statement", "table"]) {
            Self::Query
        } else {
            Self::Unknown
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Cache => "cache",
            Self::Sync => "sync",
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-level error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("remote service is not connected")]
    NotConnected,

    #[error("query error: {0}")]
    Query(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("tenant switch already in progress")]
    SwitchInProgress,

    #[error("tenant switch cancelled at step {0}")]
    SwitchCancelled(String),

    #[error("{0}")]
    Unknown(String),
}

impl RouterError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) | Self::NotConnected => ErrorCategory::Connection,
            Self::Query(_) => ErrorCategory::Query,
            Self::Cache(_) => ErrorCategory::Cache,
            Self::Sync(_) | Self::SwitchCancelled(_) => ErrorCategory::Sync,
            Self::Validation(_) | Self::SwitchInProgress => ErrorCategory::Validation,
            Self::Permission(_) => ErrorCategory::Permission,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Unknown(_) => ErrorCategory::Unknown,
        }
    }

    /// Build an error of the category the message classifies to.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorCategory::classify(&message) {
            ErrorCategory::Connection => Self::Connection(message),
            ErrorCategory::Query => Self::Query(message),
            ErrorCategory::Cache => Self::Cache(message),
            ErrorCategory::Sync => Self::Sync(message),
            ErrorCategory::Validation => Self::Validation(message),
            ErrorCategory::Permission => Self::Permission(message),
            ErrorCategory::Timeout => Self::Timeout(Duration::ZERO),
            ErrorCategory::Unknown => Self::Unknown(message),
        }
    }
}

impl From<StorageError> for RouterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => Self::Connection(msg),
            StorageError::NotFound(what) => Self::Query(format!("not found: {}", what)),
            StorageError::Backend(msg) => Self::from_message(msg),
        }
    }
}

/// Severity assigned to a category from its accumulated error count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// `< 3 → Low`, `< 10 → Medium`, `< 25 → High`, else `Critical`.
    #[must_use]
    pub fn from_count(count: u64) -> Self {
        match count {
            0..=2 => Self::Low,
            3..=9 => Self::Medium,
            10..=24 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Per-category error counter with severity escalation.
///
/// Escalation is independent of whether the error was propagated or
/// swallowed by a fallback path.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    counts: Mutex<HashMap<ErrorCategory, u64>>,
}

impl ErrorTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an error and return the category's severity after counting.
    pub fn record(&self, category: ErrorCategory) -> ErrorSeverity {
        let count = {
            let mut counts = self.counts.lock();
            let entry = counts.entry(category).or_insert(0);
            *entry += 1;
            *entry
        };
        crate::metrics::record_error(category.as_str());
        ErrorSeverity::from_count(count)
    }

    #[must_use]
    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.counts.lock().get(&category).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn severity(&self, category: ErrorCategory) -> ErrorSeverity {
        ErrorSeverity::from_count(self.count(category))
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_keywords() {
        assert_eq!(ErrorCategory::classify("Connection refused"), ErrorCategory::Connection);
        assert_eq!(ErrorCategory::classify("network unreachable"), ErrorCategory::Connection);
        assert_eq!(ErrorCategory::classify("request timed out"), ErrorCategory::Timeout);
        assert_eq!(ErrorCategory::classify("connection timeout"), ErrorCategory::Timeout);
        assert_eq!(ErrorCategory::classify("permission denied for table"), ErrorCategory::Permission);
        assert_eq!(ErrorCategory::classify("invalid tenant id"), ErrorCategory::Validation);
        assert_eq!(ErrorCategory::classify("cache entry corrupt"), ErrorCategory::Cache);
        assert_eq!(ErrorCategory::classify("live query dropped"), ErrorCategory::Sync);
        assert_eq!(ErrorCategory::classify("parse error near FROM"), ErrorCategory::Query);
        assert_eq!(ErrorCategory::classify("something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: RouterError = StorageError::Unavailable("remote down".into()).into();
        assert_eq!(err.category(), ErrorCategory::Connection);

        let err: RouterError = StorageError::Backend("syntax error in statement".into()).into();
        assert_eq!(err.category(), ErrorCategory::Query);
    }

    #[test]
    fn test_severity_escalates_with_count() {
        let tracker = ErrorTracker::new();
        let mut seen = Vec::new();
        for _ in 0..30 {
            seen.push(tracker.record(ErrorCategory::Connection));
        }
        assert_eq!(seen[0], ErrorSeverity::Low);
        assert_eq!(seen[2], ErrorSeverity::Medium);
        assert_eq!(seen[9], ErrorSeverity::High);
        assert_eq!(seen[24], ErrorSeverity::Critical);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));

        // Other categories are unaffected
        assert_eq!(tracker.severity(ErrorCategory::Query), ErrorSeverity::Low);
        assert_eq!(tracker.count(ErrorCategory::Connection), 30);
    }
}
