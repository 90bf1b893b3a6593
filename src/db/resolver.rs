use crate::db::backend::Backend;
use crate::db::error::DbError;
use crate::models::tenant::TenantRecord;
use crate::services::metrics::TENANT_REJECTIONS_COUNTER;

/// Looks a tenant up in the control registry.
pub async fn lookup<B: Backend>(
    backend: &B,
    control: &B::Handle,
    tenant_id: &str,
) -> Result<Option<TenantRecord>, DbError> {
    backend
        .fetch_tenant(control, tenant_id)
        .await
        .map_err(|e| DbError::query(format!("look up tenant {tenant_id}"), e))
}

/// Resolves a tenant that may be connected to.
///
/// Missing and non-`active` tenants are rejected before any connection to
/// their database is attempted, so a suspended tenant stays unreachable
/// even through an id that was valid earlier.
pub async fn resolve_active<B: Backend>(
    backend: &B,
    control: &B::Handle,
    tenant_id: &str,
) -> Result<TenantRecord, DbError> {
    match lookup(backend, control, tenant_id).await? {
        None => {
            TENANT_REJECTIONS_COUNTER.with_label_values(&["not_found"]).inc();
            Err(DbError::TenantNotFound(tenant_id.to_owned()))
        }
        Some(tenant) if !tenant.status.is_active() => {
            TENANT_REJECTIONS_COUNTER.with_label_values(&["inactive"]).inc();
            Err(DbError::TenantInactive {
                tenant_id: tenant_id.to_owned(),
                status: tenant.status.to_string(),
            })
        }
        Some(tenant) => Ok(tenant),
    }
}
