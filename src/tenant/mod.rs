// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-tenant isolation: the current context, query rewriting, access
//! auditing and the tenant switch saga.

pub mod context;
pub mod isolation;
pub mod manager;
pub mod switch;

pub use context::{AuditLog, TenantAccessAudit, TenantContext, ADMIN_ROLE};
pub use isolation::{add_tenant_isolation_to_query, TENANT_PARAM};
pub use manager::MultiTenantManager;
pub use switch::{SwitchStep, TenantSwitchHandler, TenantSwitchState};
