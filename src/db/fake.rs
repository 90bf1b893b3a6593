//! In-memory stand-in for PostgreSQL used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::migrate::{MigrateError, Migrator};

use crate::config::{ConnectionConfig, DatabaseConfig, PoolSettings, SslMode};
use crate::db::backend::{Backend, ConnectTarget};
use crate::db::migrate::{AppliedMigrations, MigrationTarget};
use crate::models::tenant::{ProvisioningRecord, ProvisioningState, TenantRecord, TenantStatus};

pub const UNREACHABLE_HOST: &str = "unreachable.invalid";

fn refused() -> sqlx::Error {
    sqlx::Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused))
}

fn db_error(message: impl Into<String>) -> sqlx::Error {
    sqlx::Error::Protocol(message.into())
}

pub fn test_config() -> DatabaseConfig {
    let control = ConnectionConfig {
        host: "db.test".into(),
        port: 5432,
        database: "control".into(),
        user: "platform".into(),
        password: "secret".into(),
        ssl_mode: SslMode::Disable,
    };
    DatabaseConfig {
        tenant: control.clone(),
        control,
        control_pool: PoolSettings::control_defaults(),
        tenant_pool: PoolSettings::tenant_defaults(),
        ping_timeout: Duration::from_millis(200),
    }
}

/// Schema state of one fake database, shared by every handle opened on it.
#[derive(Debug, Default)]
pub struct FakeDatabase {
    statements: Vec<String>,
    /// Rows of `_sqlx_migrations`: version -> success.
    migrations: BTreeMap<i64, bool>,
}

#[derive(Debug, Clone)]
pub struct FakeHandle {
    pub id: usize,
    pub database: String,
    alive: Arc<AtomicBool>,
    hang: Arc<AtomicBool>,
    db: Arc<Mutex<FakeDatabase>>,
}

impl FakeHandle {
    fn new(id: usize, database: &str, db: Arc<Mutex<FakeDatabase>>) -> Self {
        Self {
            id,
            database: database.to_owned(),
            alive: Arc::new(AtomicBool::new(true)),
            hang: Arc::new(AtomicBool::new(false)),
            db,
        }
    }

    /// A handle on a private database, for migration tests.
    pub fn standalone(database: &str) -> Self {
        Self::new(0, database, Arc::default())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.db.lock().unwrap().statements.clone()
    }

    fn check(&self) -> Result<(), sqlx::Error> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(sqlx::Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    /// Runs a statement. Any statement containing `FAIL` is rejected like a
    /// syntax error.
    pub fn execute(&self, sql: &str) -> Result<(), sqlx::Error> {
        self.check()?;
        if sql.contains("FAIL") {
            return Err(db_error(format!("syntax error in {sql:?}")));
        }
        self.db.lock().unwrap().statements.push(sql.to_owned());
        Ok(())
    }

    /// Leaves a `success = false` row behind, as a migration cut short
    /// outside a transaction does.
    pub fn mark_dirty(&self, version: i64) {
        self.db.lock().unwrap().migrations.insert(version, false);
    }

    fn validate(&self, migrator: &Migrator) -> Result<AppliedMigrations, MigrateError> {
        let db = self.db.lock().unwrap();
        if let Some((&version, _)) = db.migrations.iter().find(|(_, ok)| !**ok) {
            return Err(MigrateError::Dirty(version));
        }
        if let Some(&version) = db.migrations.keys().find(|v| !migrator.version_exists(**v)) {
            return Err(MigrateError::VersionMissing(version));
        }
        Ok(AppliedMigrations {
            versions: db.migrations.keys().copied().collect(),
            dirty: None,
        })
    }
}

/// Follows `Migrator::run`/`undo`: each migration is atomic, so a failing
/// one leaves no row behind.
#[async_trait]
impl MigrationTarget for FakeHandle {
    async fn applied(&self) -> Result<AppliedMigrations, MigrateError> {
        self.check()?;
        let db = self.db.lock().unwrap();
        Ok(AppliedMigrations {
            versions: db.migrations.iter().filter(|(_, ok)| **ok).map(|(v, _)| *v).collect(),
            dirty: db.migrations.iter().find(|(_, ok)| !**ok).map(|(v, _)| *v),
        })
    }

    async fn run(&self, migrator: &Migrator) -> Result<(), MigrateError> {
        self.check()?;
        let applied = self.validate(migrator)?;
        for m in migrator.iter().filter(|m| m.migration_type.is_up_migration()) {
            if applied.versions.contains(&m.version) {
                continue;
            }
            self.execute(&m.sql)
                .map_err(|e| MigrateError::ExecuteMigration(e, m.version))?;
            self.db.lock().unwrap().migrations.insert(m.version, true);
        }
        Ok(())
    }

    async fn undo(&self, migrator: &Migrator, target: i64) -> Result<(), MigrateError> {
        self.check()?;
        let applied = self.validate(migrator)?;
        for m in migrator.iter().rev().filter(|m| {
            m.migration_type.is_down_migration() && m.version > target && applied.versions.contains(&m.version)
        }) {
            self.execute(&m.sql)
                .map_err(|e| MigrateError::ExecuteMigration(e, m.version))?;
            self.db.lock().unwrap().migrations.remove(&m.version);
        }
        Ok(())
    }

    async fn force(&self, migrator: &Migrator, version: Option<i64>) -> Result<(), MigrateError> {
        self.check()?;
        let mut db = self.db.lock().unwrap();
        db.migrations
            .retain(|v, ok| *ok && version.is_some_and(|keep| *v <= keep));
        if let Some(keep) = version {
            for m in migrator
                .iter()
                .filter(|m| m.migration_type.is_up_migration() && m.version <= keep)
            {
                db.migrations.entry(m.version).or_insert(true);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeState {
    tenants: HashMap<String, TenantRecord>,
    databases: HashMap<String, Arc<Mutex<FakeDatabase>>>,
    handles: Vec<FakeHandle>,
    opens: HashMap<String, usize>,
    journal: HashMap<String, ProvisioningRecord>,
    events: Vec<String>,
    failing: HashSet<&'static str>,
    open_delays: HashMap<String, Duration>,
}

/// Fake backend keeping tenants, databases and open handles in memory.
///
/// Every side effect is appended to an event log (`open:db`, `close:db`,
/// `terminate:db`, `drop:db`, ...) so tests can assert ordering.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
    open_delay: Option<Duration>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.add_database("control");
        backend
    }

    /// Slows down `open` to widen race windows.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn with_tenant(self, id: &str, database: &str, status: TenantStatus) -> Self {
        self.add_database(database);
        self.state.lock().unwrap().tenants.insert(
            id.to_owned(),
            TenantRecord {
                id: id.to_owned(),
                name: format!("Tenant {id}"),
                slug: id.to_lowercase(),
                database_name: database.to_owned(),
                node_number: 1,
                status,
            },
        );
        self
    }

    pub fn add_database(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .databases
            .entry(name.to_owned())
            .or_default();
    }

    pub fn set_status(&self, id: &str, status: TenantStatus) {
        if let Some(t) = self.state.lock().unwrap().tenants.get_mut(id) {
            t.status = status;
        }
    }

    pub fn remove_tenant(&self, id: &str) {
        self.state.lock().unwrap().tenants.remove(id);
    }

    /// Makes the named operation (`ping`, `close`, `terminate`, `drop`,
    /// `journal`, `fetch`) fail from now on.
    pub fn fail(&self, operation: &'static str) {
        self.state.lock().unwrap().failing.insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.state.lock().unwrap().failing.remove(operation);
    }

    /// Makes every later `open` of `database` take `delay`.
    pub fn slow_open(&self, database: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .open_delays
            .insert(database.to_owned(), delay);
    }

    /// Simulates a network cut: every handle opened so far on `database` dies.
    pub fn sever(&self, database: &str) {
        for h in self.state.lock().unwrap().handles.iter() {
            if h.database == database {
                h.alive.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Every handle opened so far on `database` stops answering pings.
    pub fn stall(&self, database: &str) {
        for h in self.state.lock().unwrap().handles.iter() {
            if h.database == database {
                h.hang.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn opens(&self, database: &str) -> usize {
        self.state.lock().unwrap().opens.get(database).copied().unwrap_or(0)
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains_key(name)
    }

    pub fn database_statements(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .databases
            .get(name)
            .map(|db| db.lock().unwrap().statements.clone())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn journal(&self, tenant_id: &str) -> Option<ProvisioningRecord> {
        self.state.lock().unwrap().journal.get(tenant_id).cloned()
    }

    pub fn insert_journal(&self, record: ProvisioningRecord) {
        self.state
            .lock()
            .unwrap()
            .journal
            .insert(record.tenant_id.clone(), record);
    }

    fn failing(&self, operation: &str) -> bool {
        self.state.lock().unwrap().failing.contains(operation)
    }

    fn event(&self, event: String) {
        self.state.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    type Handle = FakeHandle;

    async fn open(&self, target: &ConnectTarget) -> Result<FakeHandle, sqlx::Error> {
        let delay = self
            .state
            .lock()
            .unwrap()
            .open_delays
            .get(target.database())
            .copied()
            .or(self.open_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if target.connection.host == UNREACHABLE_HOST {
            return Err(refused());
        }

        let mut state = self.state.lock().unwrap();
        let name = target.database();
        let db = state
            .databases
            .get(name)
            .cloned()
            .ok_or_else(|| db_error(format!("database \"{name}\" does not exist")))?;
        let handle = FakeHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst), name, db);
        state.handles.push(handle.clone());
        *state.opens.entry(name.to_owned()).or_default() += 1;
        state.events.push(format!("open:{name}"));
        Ok(handle)
    }

    async fn ping(&self, handle: &FakeHandle) -> Result<(), sqlx::Error> {
        if handle.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing("ping") {
            return Err(refused());
        }
        handle.check()
    }

    async fn close(&self, handle: &FakeHandle) -> Result<(), sqlx::Error> {
        self.event(format!("close:{}", handle.database));
        if self.failing("close") {
            return Err(db_error("close failed"));
        }
        handle.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_tenant(
        &self,
        control: &FakeHandle,
        tenant_id: &str,
    ) -> Result<Option<TenantRecord>, sqlx::Error> {
        control.check()?;
        if self.failing("fetch") {
            return Err(refused());
        }
        Ok(self.state.lock().unwrap().tenants.get(tenant_id).cloned())
    }

    async fn list_active_tenants(&self, control: &FakeHandle) -> Result<Vec<TenantRecord>, sqlx::Error> {
        control.check()?;
        let mut active: Vec<TenantRecord> = self
            .state
            .lock()
            .unwrap()
            .tenants
            .values()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(active)
    }

    async fn create_database(&self, control: &FakeHandle, name: &str) -> Result<(), sqlx::Error> {
        control.check()?;
        let mut state = self.state.lock().unwrap();
        if state.databases.contains_key(name) {
            return Err(db_error(format!("database \"{name}\" already exists")));
        }
        state.databases.insert(name.to_owned(), Arc::default());
        state.events.push(format!("create:{name}"));
        Ok(())
    }

    async fn terminate_sessions(&self, control: &FakeHandle, name: &str) -> Result<u64, sqlx::Error> {
        control.check()?;
        self.event(format!("terminate:{name}"));
        if self.failing("terminate") {
            return Err(db_error("permission denied to terminate sessions"));
        }
        Ok(0)
    }

    /// Refuses to drop while any handle on the database is still open,
    /// like PostgreSQL's "database is being accessed by other users".
    async fn drop_database(&self, control: &FakeHandle, name: &str) -> Result<(), sqlx::Error> {
        control.check()?;
        if self.failing("drop") {
            return Err(db_error("drop failed"));
        }
        let mut state = self.state.lock().unwrap();
        if state.handles.iter().any(|h| h.database == name && h.is_alive()) {
            return Err(db_error(format!(
                "database \"{name}\" is being accessed by other users"
            )));
        }
        state.databases.remove(name);
        state.events.push(format!("drop:{name}"));
        Ok(())
    }

    async fn record_provisioning(
        &self,
        control: &FakeHandle,
        record: &ProvisioningRecord,
    ) -> Result<(), sqlx::Error> {
        control.check()?;
        if self.failing("journal") {
            return Err(db_error("journal write failed"));
        }
        self.insert_journal(record.clone());
        Ok(())
    }

    async fn pending_provisioning(
        &self,
        control: &FakeHandle,
    ) -> Result<Vec<ProvisioningRecord>, sqlx::Error> {
        control.check()?;
        if self.failing("journal") {
            return Err(db_error("journal read failed"));
        }
        let state = self.state.lock().unwrap();
        let mut pending: Vec<ProvisioningRecord> = state
            .journal
            .values()
            .filter(|r| matches!(r.state, ProvisioningState::Creating | ProvisioningState::Migrating))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.updated_at);
        Ok(pending)
    }

    async fn delete_provisioning(&self, control: &FakeHandle, tenant_id: &str) -> Result<(), sqlx::Error> {
        control.check()?;
        self.state.lock().unwrap().journal.remove(tenant_id);
        Ok(())
    }
}
