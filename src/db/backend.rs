use async_trait::async_trait;

use crate::config::{ConnectionConfig, PoolSettings};
use crate::db::migrate::MigrationTarget;
use crate::models::tenant::{ProvisioningRecord, TenantRecord};

/// Everything needed to open one pooled handle.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub connection: ConnectionConfig,
    pub pool: PoolSettings,
}

impl ConnectTarget {
    pub fn database(&self) -> &str {
        &self.connection.database
    }
}

/// The database engine behind the connection manager.
///
/// All DDL and control-table access the manager needs goes through here;
/// the production implementation is [`crate::db::postgres::PgBackend`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// A pooled, cheaply clonable connection handle.
    type Handle: MigrationTarget + Clone + Send + Sync + 'static;

    async fn open(&self, target: &ConnectTarget) -> Result<Self::Handle, sqlx::Error>;

    async fn ping(&self, handle: &Self::Handle) -> Result<(), sqlx::Error>;

    async fn close(&self, handle: &Self::Handle) -> Result<(), sqlx::Error>;

    async fn fetch_tenant(
        &self,
        control: &Self::Handle,
        tenant_id: &str,
    ) -> Result<Option<TenantRecord>, sqlx::Error>;

    async fn list_active_tenants(&self, control: &Self::Handle) -> Result<Vec<TenantRecord>, sqlx::Error>;

    /// Must not run inside a transaction.
    async fn create_database(&self, control: &Self::Handle, name: &str) -> Result<(), sqlx::Error>;

    /// Terminates other sessions connected to `name`, returning how many.
    async fn terminate_sessions(&self, control: &Self::Handle, name: &str)
        -> Result<u64, sqlx::Error>;

    async fn drop_database(&self, control: &Self::Handle, name: &str) -> Result<(), sqlx::Error>;

    async fn record_provisioning(
        &self,
        control: &Self::Handle,
        record: &ProvisioningRecord,
    ) -> Result<(), sqlx::Error>;

    async fn pending_provisioning(
        &self,
        control: &Self::Handle,
    ) -> Result<Vec<ProvisioningRecord>, sqlx::Error>;

    async fn delete_provisioning(
        &self,
        control: &Self::Handle,
        tenant_id: &str,
    ) -> Result<(), sqlx::Error>;
}
