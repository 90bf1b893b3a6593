use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::db::backend::Backend;
use crate::db::error::DbError;
use crate::db::manager::ConnectionManager;
use crate::db::migrate::{tenant_logical_name, MigrationOutcome, MigrationRunner};
use crate::models::tenant::{ProvisioningRecord, ProvisioningState};
use crate::services::metrics::PROVISIONING_COUNTER;

/// Creates and migrates tenant databases, undoing the creation when the
/// migration fails.
///
/// Every step is journaled in the control database so that a run cut short
/// by a crash is found and cleaned up by [`ProvisioningService::reconcile`].
pub struct ProvisioningService<'a, B: Backend> {
    manager: &'a ConnectionManager<B>,
    migrations_dir: PathBuf,
}

impl<'a, B: Backend> ProvisioningService<'a, B> {
    pub fn new(manager: &'a ConnectionManager<B>, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Creates `database` and applies every tenant migration to it.
    ///
    /// If the database cannot be created nothing is cleaned up: it may
    /// belong to someone else. If migrating fails the database is dropped
    /// best-effort and the migration error is returned.
    pub async fn provision(&self, tenant_id: &str, database: &str) -> Result<MigrationOutcome, DbError> {
        // The journal row must exist before any DDL runs.
        self.manager
            .record_provisioning(&ProvisioningRecord::new(tenant_id, database, ProvisioningState::Creating))
            .await?;

        if let Err(e) = self.manager.create_tenant_database(database).await {
            self.journal(ProvisioningRecord::new(tenant_id, database, ProvisioningState::Creating).failed(&e))
                .await;
            PROVISIONING_COUNTER.with_label_values(&["failed"]).inc();
            return Err(e);
        }

        self.journal(ProvisioningRecord::new(tenant_id, database, ProvisioningState::Migrating))
            .await;

        match self.migrate(tenant_id, database).await {
            Ok(outcome) => {
                self.journal(ProvisioningRecord::new(tenant_id, database, ProvisioningState::Ready))
                    .await;
                PROVISIONING_COUNTER.with_label_values(&["ready"]).inc();
                info!(tenant_id, database, ?outcome, "Tenant database provisioned");
                Ok(outcome)
            }
            Err(e) => {
                error!(tenant_id, database, error = %e, "Tenant migration failed, dropping database");
                let record = ProvisioningRecord::new(tenant_id, database, ProvisioningState::Migrating);
                match self.manager.drop_tenant_database(tenant_id, database).await {
                    Ok(()) => self.journal(record.failed(&e)).await,
                    Err(cleanup) => {
                        // Stays in flight so that reconcile retries the drop.
                        warn!(tenant_id, database, error = %cleanup, "Cleanup after failed provisioning failed");
                        self.journal(record.with_error(&e)).await;
                    }
                }
                PROVISIONING_COUNTER.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    /// Drops a tenant database and forgets its provisioning history.
    pub async fn deprovision(&self, tenant_id: &str, database: &str) -> Result<(), DbError> {
        self.manager.drop_tenant_database(tenant_id, database).await?;
        self.manager.delete_provisioning(tenant_id).await
    }

    /// Cleans up runs that never finished (process killed between creating
    /// and migrating): the database is dropped and the run marked failed.
    /// Runs whose drop fails stay pending and are retried next time.
    /// Returns the reconciled tenant ids.
    pub async fn reconcile(&self) -> Result<Vec<String>, DbError> {
        let pending = self.manager.pending_provisioning().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        warn!(count = pending.len(), "Found interrupted tenant provisioning runs");

        let mut reconciled = Vec::new();
        for record in pending {
            let tenant_id = record.tenant_id.clone();
            let database = record.database_name.clone();
            match self.manager.drop_tenant_database(&tenant_id, &database).await {
                Ok(()) => {
                    let reason = format!("interrupted while {}, database dropped on reconcile", record.state);
                    self.journal(record.failed(reason)).await;
                    PROVISIONING_COUNTER.with_label_values(&["reconciled"]).inc();
                    info!(tenant_id = %tenant_id, database = %database, "Reconciled interrupted provisioning");
                    reconciled.push(tenant_id);
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, database = %database, error = %e, "Could not drop orphaned database");
                }
            }
        }
        Ok(reconciled)
    }

    /// [`ProvisioningService::reconcile`] for process startup: failures are
    /// logged and the caller carries on.
    pub async fn reconcile_on_startup(&self) -> Vec<String> {
        match self.reconcile().await {
            Ok(reconciled) => reconciled,
            Err(e) => {
                warn!(error = %e, "Startup reconcile failed, continuing");
                Vec::new()
            }
        }
    }

    async fn migrate(&self, tenant_id: &str, database: &str) -> Result<MigrationOutcome, DbError> {
        let handle = self.manager.open_database(database).await?;
        let result =
            MigrationRunner::run_migrations(&handle, &tenant_logical_name(tenant_id), &self.migrations_dir).await;
        self.manager.release(database, &handle).await;
        result
    }

    /// Journal updates after the first one are best-effort.
    async fn journal(&self, record: ProvisioningRecord) {
        if let Err(e) = self.manager.record_provisioning(&record).await {
            warn!(tenant_id = %record.tenant_id, state = %record.state, error = %e, "Failed to journal provisioning state");
        }
    }
}
