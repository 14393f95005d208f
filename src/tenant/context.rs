// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tenant context and the access audit trail.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Role that bypasses per-table permission checks.
pub const ADMIN_ROLE: &str = "admin";

/// The tenant queries currently run under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// `table`, `table:operation`, `table:*` or `*`. Empty grants every table.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl TenantContext {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            case_id: None,
            user_id: None,
            namespace: None,
            database: None,
            permissions: Vec::new(),
            roles: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    #[must_use]
    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Case used to scope cache entries; falls back to the tenant id.
    #[must_use]
    pub fn cache_case(&self) -> &str {
        self.case_id.as_deref().unwrap_or(&self.tenant_id)
    }

    /// Whether this context may perform `operation` on `table`.
    #[must_use]
    pub fn allows(&self, table: &str, operation: &str) -> bool {
        if self.roles.iter().any(|r| r.eq_ignore_ascii_case(ADMIN_ROLE)) || self.permissions.is_empty() {
            return true;
        }
        let table = table.to_ascii_lowercase();
        let operation = operation.to_ascii_lowercase();
        self.permissions.iter().any(|p| {
            let p = p.to_ascii_lowercase();
            match p.split_once(':') {
                _ if p == "*" => true,
                None => p == table,
                Some((t, op)) => t == table && (op == "*" || op == operation),
            }
        })
    }
}

/// One recorded tenant data access.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantAccessAudit {
    /// Epoch millis.
    pub timestamp: u64,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub operation: String,
    pub table: String,
    pub record_id: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Append-only ring buffer of [`TenantAccessAudit`] records.
pub struct AuditLog {
    entries: Mutex<VecDeque<TenantAccessAudit>>,
    capacity: usize,
}

impl AuditLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append, dropping the oldest record when full.
    pub fn record(&self, entry: TenantAccessAudit) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<TenantAccessAudit> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Newest first.
    #[must_use]
    pub fn for_tenant(&self, tenant_id: &str) -> Vec<TenantAccessAudit> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
