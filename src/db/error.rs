use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the tenant connectivity layer.
///
/// Connectivity failures are never retried here; retry policy belongs to
/// the caller. `TenantNotFound`, `TenantInactive` and `InvalidDatabaseName`
/// are client-input errors and must not be retried.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("tenant {0} not found")]
    TenantNotFound(String),

    #[error("tenant {tenant_id} is not active (status: {status})")]
    TenantInactive { tenant_id: String, status: String },

    #[error("invalid database name: {0:?}")]
    InvalidDatabaseName(String),

    #[error("failed to connect to database {database}: {source}")]
    Connect {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("database {database} did not answer ping: {source}")]
    Ping {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("ping to database {database} timed out after {timeout:?}")]
    PingTimeout { database: String, timeout: Duration },

    #[error("{operation} failed: {source}")]
    Query {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid migration source {}: {reason}", path.display())]
    MigrationSource { path: PathBuf, reason: String },

    #[error("migration {version} failed on {database}: {source}")]
    Migration {
        database: String,
        version: i64,
        #[source]
        source: sqlx::Error,
    },

    #[error("migrating {database} failed: {source}")]
    Migrate {
        database: String,
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    #[error("{database} is dirty at version {version}; fix the schema and force the version")]
    DirtyMigration { database: String, version: i64 },

    #[error("cannot roll back {requested} migration(s) on {database}: only {applied} applied")]
    RollbackOutOfRange {
        database: String,
        requested: u32,
        applied: usize,
    },

    #[error("migration {version} on {database} has no down script")]
    Irreversible { database: String, version: i64 },

    #[error("{database} is at version {version}, which is not in the migration source")]
    UnknownVersion { database: String, version: i64 },

    #[error("failed to close {failed} of {total} connection pool(s)")]
    CloseFailed { failed: usize, total: usize },

    #[error("connection manager is closed")]
    Closed,
}

impl DbError {
    pub(crate) fn query(operation: impl Into<String>, source: sqlx::Error) -> Self {
        DbError::Query {
            operation: operation.into(),
            source,
        }
    }

    /// True for errors caused by the caller's input (unknown or suspended
    /// tenant, malformed name). Callers map these to a terminal rejection.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DbError::TenantNotFound(_)
                | DbError::TenantInactive { .. }
                | DbError::InvalidDatabaseName(_)
        )
    }
}
