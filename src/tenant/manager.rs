// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Current tenant context, access validation and tenant-scoped execution.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::context::{AuditLog, TenantAccessAudit, TenantContext};
use super::isolation::{add_tenant_isolation_to_query, TENANT_PARAM};
use crate::clock::SharedClock;
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::execution::{CacheExecutionEngine, ExecutionResult};
use crate::query::parse;
use crate::storage::Params;

pub struct MultiTenantManager {
    engine: Arc<CacheExecutionEngine>,
    current: RwLock<Option<TenantContext>>,
    audit: AuditLog,
    clock: SharedClock,
    strict_isolation: bool,
    tenant_field: String,
    namespace_prefix: String,
}

impl MultiTenantManager {
    #[must_use]
    pub fn new(engine: Arc<CacheExecutionEngine>, config: &RouterConfig, clock: SharedClock) -> Self {
        Self {
            engine,
            current: RwLock::new(None),
            audit: AuditLog::new(config.audit_log_capacity),
            clock,
            strict_isolation: config.strict_isolation,
            tenant_field: config.tenant_field.clone(),
            namespace_prefix: config.tenant_cache_namespace_prefix.clone(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<CacheExecutionEngine> {
        &self.engine
    }

    #[must_use]
    pub fn current_context(&self) -> Option<TenantContext> {
        self.current.read().clone()
    }

    #[must_use]
    pub fn tenant_field(&self) -> &str {
        &self.tenant_field
    }

    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict_isolation
    }

    /// Install a context, returning the one it replaced. Only the switch
    /// saga calls this.
    pub(crate) fn set_context(&self, context: TenantContext) -> Option<TenantContext> {
        debug!(tenant_id = %context.tenant_id, "Tenant context installed");
        self.current.write().replace(context)
    }

    pub(crate) fn clear_context(&self) -> Option<TenantContext> {
        self.current.write().take()
    }

    /// Rewrite `sql` with the tenant predicate/payload field.
    #[must_use]
    pub fn add_tenant_isolation_to_query(&self, sql: &str) -> String {
        add_tenant_isolation_to_query(sql, &self.tenant_field)
    }

    /// Check `operation` on every table against the current context.
    ///
    /// Under strict isolation a missing context denies everything. Without
    /// strict isolation a missing context passes and `Ok(None)` is returned.
    pub fn validate_access(&self, tables: &[String], operation: &str) -> Result<Option<TenantContext>> {
        let Some(context) = self.current_context() else {
            if self.strict_isolation {
                if let Some(table) = tables.first() {
                    crate::metrics::record_access_denied(table);
                }
                return Err(RouterError::Permission("no tenant context set".into()));
            }
            return Ok(None);
        };

        for table in tables {
            if !context.allows(table, operation) {
                crate::metrics::record_access_denied(table);
                warn!(tenant_id = %context.tenant_id, %table, operation, "Tenant access denied");
                return Err(RouterError::Permission(format!(
                    "tenant '{}' may not {} '{}'",
                    context.tenant_id, operation, table
                )));
            }
        }
        Ok(Some(context))
    }

    /// Run a query scoped to the current tenant: rewrite, validate, audit,
    /// then execute with the tenant's cache scope.
    #[instrument(skip(self, params))]
    pub async fn tenant_query(&self, sql: &str, params: &Params) -> Result<ExecutionResult> {
        let accesses: Vec<(String, String)> = parse(sql)
            .iter()
            .flat_map(|stmt| {
                let op = stmt.verb.as_str().to_ascii_lowercase();
                stmt.tables.iter().map(move |t| (t.clone(), op.clone()))
            })
            .collect();

        let context = match self.validate_accesses(&accesses) {
            Ok(Some(context)) => context,
            Ok(None) => return self.engine.execute_query(sql, params, None, None).await,
            Err(e) => {
                self.audit_accesses(&accesses, Err(&e));
                return Err(e);
            }
        };

        let rewritten = self.add_tenant_isolation_to_query(sql);
        let mut params = params.clone();
        params.insert(TENANT_PARAM.into(), Value::String(context.tenant_id.clone()));

        let result = self.engine.execute_for_tenant(&rewritten, &params, &context).await;
        self.audit_accesses(&accesses, result.as_ref().map(|_| &context));
        result
    }

    /// Create a record in `table` stamped with the tenant field.
    pub async fn tenant_create(&self, table: &str, data: Value) -> Result<Value> {
        let access = vec![(table.to_ascii_lowercase(), "create".to_string())];
        let context = match self.validate_accesses(&access) {
            Ok(context) => context,
            Err(e) => {
                self.audit_accesses(&access, Err(&e));
                return Err(e);
            }
        };

        let mut data = data;
        if let (Some(context), Value::Object(map)) = (&context, &mut data) {
            map.insert(self.tenant_field.clone(), Value::String(context.tenant_id.clone()));
        }

        let created = self.engine.remote().create(table, data).await.map_err(RouterError::from);
        match &created {
            Ok(record) => {
                let (user_id, case_id) = match &context {
                    Some(c) => (c.user_id.as_deref(), Some(c.cache_case())),
                    None => (None, None),
                };
                self.engine
                    .invalidate_tables(&[table.to_ascii_lowercase()], "CREATE", user_id, case_id)
                    .await;
                if let Some(context) = &context {
                    self.audit.record(TenantAccessAudit {
                        timestamp: self.clock.now_ms(),
                        tenant_id: context.tenant_id.clone(),
                        user_id: context.user_id.clone(),
                        operation: "create".into(),
                        table: table.to_ascii_lowercase(),
                        record_id: record.get("id").and_then(Value::as_str).map(str::to_string),
                        success: true,
                        error_message: None,
                    });
                }
            }
            Err(e) => self.audit_accesses(&access, Err(e)),
        }
        created
    }

    /// Cache namespace key for the current tenant, `None` without a context.
    #[must_use]
    pub fn tenant_cache_key(&self, key: &str) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .map(|c| format!("{}:{}:{}", self.namespace_prefix, c.tenant_id, key))
    }

    /// Newest first.
    #[must_use]
    pub fn recent_audits(&self, limit: usize) -> Vec<TenantAccessAudit> {
        self.audit.recent(limit)
    }

    #[must_use]
    pub fn audits_for_tenant(&self, tenant_id: &str) -> Vec<TenantAccessAudit> {
        self.audit.for_tenant(tenant_id)
    }

    fn validate_accesses(&self, accesses: &[(String, String)]) -> Result<Option<TenantContext>> {
        let mut context = self.validate_access(&[], "")?;
        for (table, op) in accesses {
            context = self.validate_access(std::slice::from_ref(table), op)?;
        }
        Ok(context)
    }

    /// One audit record per table access. Accesses without a context are
    /// recorded under an empty tenant id.
    fn audit_accesses(&self, accesses: &[(String, String)], outcome: std::result::Result<&TenantContext, &RouterError>) {
        let current = self.current_context();
        let (tenant_id, user_id) = match (&outcome, &current) {
            (Ok(c), _) => (c.tenant_id.clone(), c.user_id.clone()),
            (Err(_), Some(c)) => (c.tenant_id.clone(), c.user_id.clone()),
            (Err(_), None) => (String::new(), None),
        };
        let now = self.clock.now_ms();
        for (table, op) in accesses {
            self.audit.record(TenantAccessAudit {
                timestamp: now,
                tenant_id: tenant_id.clone(),
                user_id: user_id.clone(),
                operation: op.clone(),
                table: table.clone(),
                record_id: None,
                success: outcome.is_ok(),
                error_message: outcome.err().map(ToString::to_string),
            });
        }
    }
}
