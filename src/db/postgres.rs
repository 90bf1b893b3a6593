use async_trait::async_trait;
use sqlx::migrate::{Migrate, MigrateError, Migrator};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use crate::config::SslMode;
use crate::db::backend::{Backend, ConnectTarget};
use crate::db::migrate::{AppliedMigrations, MigrationTarget};
use crate::models::tenant::{ProvisioningRecord, TenantRecord};

/// PostgreSQL backend built on sqlx pools.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgBackend;

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Handle = PgPool;

    async fn open(&self, target: &ConnectTarget) -> Result<PgPool, sqlx::Error> {
        let c = &target.connection;
        let options = PgConnectOptions::new()
            .host(&c.host)
            .port(c.port)
            .username(&c.user)
            .password(&c.password)
            .database(&c.database)
            .ssl_mode(ssl_mode(c.ssl_mode));

        PgPoolOptions::new()
            .max_connections(target.pool.max_open)
            .min_connections(target.pool.min_idle.min(target.pool.max_open))
            .max_lifetime(Some(target.pool.max_lifetime))
            .idle_timeout(Some(target.pool.idle_timeout))
            .acquire_timeout(target.pool.acquire_timeout)
            .connect_with(options)
            .await
    }

    async fn ping(&self, handle: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(handle).await?;
        Ok(())
    }

    async fn close(&self, handle: &PgPool) -> Result<(), sqlx::Error> {
        handle.close().await;
        Ok(())
    }

    async fn fetch_tenant(
        &self,
        control: &PgPool,
        tenant_id: &str,
    ) -> Result<Option<TenantRecord>, sqlx::Error> {
        sqlx::query_as::<_, TenantRecord>(
            "SELECT id::TEXT AS id, name, slug, database_name, node_number, status
             FROM tenants
             WHERE id::TEXT = $1",
        )
        .bind(tenant_id)
        .fetch_optional(control)
        .await
    }

    async fn list_active_tenants(&self, control: &PgPool) -> Result<Vec<TenantRecord>, sqlx::Error> {
        sqlx::query_as::<_, TenantRecord>(
            "SELECT id::TEXT AS id, name, slug, database_name, node_number, status
             FROM tenants
             WHERE status = 'active'
             ORDER BY node_number, slug",
        )
        .fetch_all(control)
        .await
    }

    async fn create_database(&self, control: &PgPool, name: &str) -> Result<(), sqlx::Error> {
        // Sent as a simple query: CREATE DATABASE refuses to run in a transaction.
        sqlx::raw_sql(&format!(r#"CREATE DATABASE "{name}""#))
            .execute(control)
            .await?;
        Ok(())
    }

    async fn terminate_sessions(&self, control: &PgPool, name: &str) -> Result<u64, sqlx::Error> {
        let terminated: Vec<bool> = sqlx::query_scalar(
            "SELECT pg_terminate_backend(pid)
             FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(name)
        .fetch_all(control)
        .await?;
        Ok(terminated.into_iter().filter(|ok| *ok).count() as u64)
    }

    async fn drop_database(&self, control: &PgPool, name: &str) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(&format!(r#"DROP DATABASE IF EXISTS "{name}""#))
            .execute(control)
            .await?;
        Ok(())
    }

    async fn record_provisioning(
        &self,
        control: &PgPool,
        record: &ProvisioningRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO tenant_provisioning (tenant_id, database_name, state, last_error, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (tenant_id) DO UPDATE SET
               database_name = EXCLUDED.database_name,
               state         = EXCLUDED.state,
               last_error    = EXCLUDED.last_error,
               updated_at    = EXCLUDED.updated_at",
        )
        .bind(&record.tenant_id)
        .bind(&record.database_name)
        .bind(record.state.as_str())
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(control)
        .await?;
        Ok(())
    }

    async fn pending_provisioning(
        &self,
        control: &PgPool,
    ) -> Result<Vec<ProvisioningRecord>, sqlx::Error> {
        sqlx::query_as::<_, ProvisioningRecord>(
            "SELECT tenant_id, database_name, state, last_error, updated_at
             FROM tenant_provisioning
             WHERE state IN ('creating', 'migrating')
             ORDER BY updated_at",
        )
        .fetch_all(control)
        .await
    }

    async fn delete_provisioning(&self, control: &PgPool, tenant_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM tenant_provisioning WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(control)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationTarget for PgPool {
    async fn applied(&self) -> Result<AppliedMigrations, MigrateError> {
        let mut conn = self.acquire().await?;
        conn.ensure_migrations_table().await?;
        let dirty = conn.dirty_version().await?;
        let versions = conn
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|m| m.version)
            .filter(|v| Some(*v) != dirty)
            .collect();
        Ok(AppliedMigrations { versions, dirty })
    }

    async fn run(&self, migrator: &Migrator) -> Result<(), MigrateError> {
        migrator.run(self).await
    }

    async fn undo(&self, migrator: &Migrator, target: i64) -> Result<(), MigrateError> {
        migrator.undo(self, target).await
    }

    async fn force(&self, migrator: &Migrator, version: Option<i64>) -> Result<(), MigrateError> {
        let mut conn = self.acquire().await?;
        conn.ensure_migrations_table().await?;
        drop(conn);

        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM _sqlx_migrations WHERE success = false OR $1::BIGINT IS NULL OR version > $1")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        if let Some(version) = version {
            for m in migrator
                .iter()
                .filter(|m| m.migration_type.is_up_migration() && m.version <= version)
            {
                sqlx::query(
                    "INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time)
                     VALUES ($1, $2, TRUE, $3, -1)
                     ON CONFLICT (version) DO NOTHING",
                )
                .bind(m.version)
                .bind(&*m.description)
                .bind(&*m.checksum)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

// Needs a reachable server: set CONTROL_DB_* and run with `--ignored`.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::error::DbError;
    use crate::db::manager::ConnectionManager;
    use crate::db::migrate::{MigrationOutcome, MigrationRunner};
    use std::fs;

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server"]
    async fn test_create_migrate_and_drop_against_postgres() {
        let _ = dotenvy::dotenv();
        let config = Config::from_env().unwrap();
        let manager = ConnectionManager::connect(&config.database).await.unwrap();
        let database = format!("tenantdb_it_{}", std::process::id());

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("1_users.up.sql"), "CREATE TABLE users (id BIGINT)").unwrap();
        fs::write(dir.path().join("1_users.down.sql"), "DROP TABLE users").unwrap();
        fs::write(dir.path().join("2_lessons.up.sql"), "CREATE TABLE lessons (id BIGINT)").unwrap();
        fs::write(dir.path().join("2_lessons.down.sql"), "DROP TABLE lessons").unwrap();

        manager.create_tenant_database(&database).await.unwrap();
        let err = manager.create_tenant_database(&database).await.unwrap_err();
        assert!(matches!(err, DbError::Query { .. }));

        let pool = manager.open_database(&database).await.unwrap();
        let outcome = MigrationRunner::run_migrations(&pool, &database, dir.path()).await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Applied { from: None, to: 2, count: 2 });
        let again = MigrationRunner::run_migrations(&pool, &database, dir.path()).await.unwrap();
        assert_eq!(again, MigrationOutcome::NoChange);

        let back = MigrationRunner::rollback(&pool, &database, dir.path(), 1).await.unwrap();
        assert_eq!(back, MigrationOutcome::RolledBack { from: 2, to: Some(1), count: 1 });
        MigrationRunner::force_version(&pool, &database, dir.path(), Some(2)).await.unwrap();
        let version = MigrationRunner::get_version(&pool, &database, dir.path()).await.unwrap();
        assert_eq!((version.version, version.dirty), (2, false));

        manager.release(&database, &pool).await;
        manager.drop_tenant_database("it", &database).await.unwrap();
        manager.close_all().await.unwrap();
    }
}
