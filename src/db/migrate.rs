use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::migrate::{MigrateError, Migrator};
use tracing::{info, warn};

use crate::db::error::DbError;

/// Logical name of the control database, used in logs and errors.
pub const CONTROL_DATABASE: &str = "control";

/// Logical name of a tenant database, used in logs and errors.
pub fn tenant_logical_name(tenant_id: &str) -> String {
    format!("tenant_{tenant_id}")
}

/// Migration history of one database, as recorded in its `_sqlx_migrations`
/// table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedMigrations {
    /// Applied versions, ascending.
    pub versions: Vec<i64>,
    /// First version whose migration did not complete.
    pub dirty: Option<i64>,
}

impl AppliedMigrations {
    pub fn latest(&self) -> Option<i64> {
        self.versions.last().copied()
    }
}

/// A database that a [`Migrator`] can be run against.
///
/// Each database keeps its own `_sqlx_migrations` table, so the control
/// database and every tenant database carry independent versions even when
/// they share one migration directory.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    async fn applied(&self) -> Result<AppliedMigrations, MigrateError>;

    async fn run(&self, migrator: &Migrator) -> Result<(), MigrateError>;

    /// Reverts every applied migration newer than `target`.
    async fn undo(&self, migrator: &Migrator, target: i64) -> Result<(), MigrateError>;

    /// Rewrites the history so that exactly the migrations up to `version`
    /// are recorded as applied, without running any SQL.
    async fn force(&self, migrator: &Migrator, version: Option<i64>) -> Result<(), MigrateError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Applied {
        from: Option<i64>,
        to: i64,
        count: usize,
    },
    RolledBack {
        from: i64,
        to: Option<i64>,
        count: usize,
    },
    NoChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MigrationVersion {
    pub version: i64,
    pub dirty: bool,
    pub found: bool,
    /// Newest version available in the migration directory.
    pub latest: Option<i64>,
}

/// Reads `{version}_{name}.up.sql` / `.down.sql` files from `path`.
pub async fn load(path: &Path) -> Result<Migrator, DbError> {
    Migrator::new(path).await.map_err(|e| DbError::MigrationSource {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn migrate_error(database: &str, e: MigrateError) -> DbError {
    let database = database.to_owned();
    match e {
        MigrateError::ExecuteMigration(source, version) => DbError::Migration {
            database,
            version,
            source,
        },
        MigrateError::Dirty(version) => DbError::DirtyMigration { database, version },
        MigrateError::VersionMissing(version) => DbError::UnknownVersion { database, version },
        source => DbError::Migrate { database, source },
    }
}

fn description(migrator: &Migrator, version: i64) -> String {
    migrator
        .iter()
        .find(|m| m.version == version && m.migration_type.is_up_migration())
        .map(|m| m.description.to_string())
        .unwrap_or_default()
}

/// Applies and reverts migrations with sqlx's [`Migrator`].
pub struct MigrationRunner;

impl MigrationRunner {
    /// Applies every pending migration in ascending order.
    ///
    /// A database left dirty by an interrupted migration is refused until an
    /// operator repairs it with [`MigrationRunner::force_version`].
    pub async fn run_migrations<T>(
        target: &T,
        database: &str,
        path: &Path,
    ) -> Result<MigrationOutcome, DbError>
    where
        T: MigrationTarget + ?Sized,
    {
        let migrator = load(path).await?;
        let before = Self::clean_state(target, database).await?;

        target
            .run(&migrator)
            .await
            .map_err(|e| migrate_error(database, e))?;

        let after = target.applied().await.map_err(|e| migrate_error(database, e))?;
        let new: Vec<i64> = after
            .versions
            .iter()
            .copied()
            .filter(|v| !before.versions.contains(v))
            .collect();

        let Some(to) = after.latest().filter(|_| !new.is_empty()) else {
            info!(database, version = ?before.latest(), "No pending migrations");
            return Ok(MigrationOutcome::NoChange);
        };
        for version in &new {
            info!(database, version, name = %description(&migrator, *version), "Applied migration");
        }
        Ok(MigrationOutcome::Applied {
            from: before.latest(),
            to,
            count: new.len(),
        })
    }

    /// Reverts exactly `steps` applied migrations, newest first. Every check
    /// happens before the first down script runs.
    pub async fn rollback<T>(
        target: &T,
        database: &str,
        path: &Path,
        steps: u32,
    ) -> Result<MigrationOutcome, DbError>
    where
        T: MigrationTarget + ?Sized,
    {
        if steps == 0 {
            return Ok(MigrationOutcome::NoChange);
        }

        let migrator = load(path).await?;
        let state = Self::clean_state(target, database).await?;
        let applied = &state.versions;

        if let Some(&version) = applied.iter().find(|v| !migrator.version_exists(**v)) {
            return Err(DbError::UnknownVersion {
                database: database.to_owned(),
                version,
            });
        }
        if steps as usize > applied.len() {
            return Err(DbError::RollbackOutOfRange {
                database: database.to_owned(),
                requested: steps,
                applied: applied.len(),
            });
        }

        let keep = applied.len() - steps as usize;
        let reverting = &applied[keep..];
        let reversible =
            |v: i64| migrator.iter().any(|m| m.version == v && m.migration_type.is_down_migration());
        if let Some(&version) = reverting.iter().find(|v| !reversible(**v)) {
            return Err(DbError::Irreversible {
                database: database.to_owned(),
                version,
            });
        }

        let to = keep.checked_sub(1).map(|i| applied[i]);
        target
            .undo(&migrator, to.unwrap_or(i64::MIN))
            .await
            .map_err(|e| migrate_error(database, e))?;
        for version in reverting.iter().rev() {
            info!(database, version, name = %description(&migrator, *version), "Reverted migration");
        }

        Ok(MigrationOutcome::RolledBack {
            from: state.latest().unwrap_or_default(),
            to,
            count: reverting.len(),
        })
    }

    /// Current version of `database`; `found` is false if never migrated.
    pub async fn get_version<T>(
        target: &T,
        database: &str,
        path: &Path,
    ) -> Result<MigrationVersion, DbError>
    where
        T: MigrationTarget + ?Sized,
    {
        let migrator = load(path).await?;
        let state = target.applied().await.map_err(|e| migrate_error(database, e))?;
        let latest = migrator
            .iter()
            .filter(|m| m.migration_type.is_up_migration())
            .map(|m| m.version)
            .max();

        Ok(MigrationVersion {
            version: state.dirty.or(state.latest()).unwrap_or(0),
            dirty: state.dirty.is_some(),
            found: state.dirty.is_some() || !state.versions.is_empty(),
            latest,
        })
    }

    /// Operator repair: records every migration up to `version` as applied
    /// and clean (or forgets all of them when `None`) without running SQL.
    pub async fn force_version<T>(
        target: &T,
        database: &str,
        path: &Path,
        version: Option<i64>,
    ) -> Result<(), DbError>
    where
        T: MigrationTarget + ?Sized,
    {
        let migrator = load(path).await?;
        if let Some(v) = version.filter(|v| !migrator.version_exists(*v)) {
            return Err(DbError::UnknownVersion {
                database: database.to_owned(),
                version: v,
            });
        }
        target
            .force(&migrator, version)
            .await
            .map_err(|e| migrate_error(database, e))?;
        warn!(database, version = ?version, "Migration version forced");
        Ok(())
    }

    async fn clean_state<T>(target: &T, database: &str) -> Result<AppliedMigrations, DbError>
    where
        T: MigrationTarget + ?Sized,
    {
        let state = target.applied().await.map_err(|e| migrate_error(database, e))?;
        match state.dirty {
            Some(version) => Err(DbError::DirtyMigration {
                database: database.to_owned(),
                version,
            }),
            None => Ok(state),
        }
    }
}
