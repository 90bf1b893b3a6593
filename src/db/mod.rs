pub mod backend;
pub mod error;
pub mod manager;
pub mod migrate;
pub mod postgres;
pub mod resolver;

#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;

use tracing::{error, info};

pub use backend::{Backend, ConnectTarget};
pub use error::DbError;
pub use manager::{ConnectionManager, HealthReport};
pub use migrate::{MigrationOutcome, MigrationRunner, MigrationVersion};
pub use postgres::PgBackend;

/// Apply the control-database migrations found in `path`.
pub async fn run_control_migrations<B: Backend>(
    manager: &ConnectionManager<B>,
    path: &Path,
) -> Result<MigrationOutcome, DbError> {
    MigrationRunner::run_migrations(manager.control(), migrate::CONTROL_DATABASE, path).await
}

/// Bring every active tenant database up to date (idempotent, safe on every
/// startup). One tenant failing does not stop the others; the ids of the
/// tenants that failed are returned.
pub async fn migrate_all_existing_tenants<B: Backend>(
    manager: &ConnectionManager<B>,
    path: &Path,
) -> Result<Vec<String>, DbError> {
    let tenants = manager.active_tenants().await?;
    let mut failed = Vec::new();

    for tenant in tenants {
        let logical = migrate::tenant_logical_name(&tenant.id);
        let result = match manager.get_tenant_connection(&tenant.id).await {
            Ok(handle) => MigrationRunner::run_migrations(&handle, &logical, path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => info!(tenant_id = %tenant.id, database = %tenant.database_name, ?outcome, "Migrated tenant database"),
            Err(e) => {
                error!(tenant_id = %tenant.id, database = %tenant.database_name, error = %e, "Tenant migration failed");
                failed.push(tenant.id);
            }
        }
    }
    Ok(failed)
}
