use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, DatabaseConfig, PoolSettings};
use crate::db::backend::{Backend, ConnectTarget};
use crate::db::error::DbError;
use crate::db::postgres::PgBackend;
use crate::db::resolver;
use crate::models::tenant::{ProvisioningRecord, TenantRecord};
use crate::services::metrics::{pool_event, TENANT_POOLS_GAUGE};

/// Database names end up inside DDL via format!(), so only lowercase ASCII
/// letters, digits and underscores are accepted, starting with a letter,
/// at most 63 bytes (PostgreSQL's identifier limit).
pub fn is_valid_database_name(name: &str) -> bool {
    let len = name.len();
    (1..=63).contains(&len)
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn validate_database_name(name: &str) -> Result<(), DbError> {
    if is_valid_database_name(name) {
        Ok(())
    } else {
        Err(DbError::InvalidDatabaseName(name.to_owned()))
    }
}

#[derive(Clone)]
struct CachedHandle<H> {
    handle: H,
    database: String,
    /// Distinguishes this entry from a later replacement under the same key.
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub tenant_connections: usize,
}

/// Owns the control-database pool and one cached pool per tenant.
///
/// Construct once at startup and share by reference (usually behind an
/// `Arc`); there is no global instance.
pub struct ConnectionManager<B: Backend = PgBackend> {
    backend: B,
    control: B::Handle,
    control_database: String,
    tenant_template: ConnectionConfig,
    tenant_pool: PoolSettings,
    ping_timeout: Duration,
    tenants: RwLock<HashMap<String, CachedHandle<B::Handle>>>,
    /// One gate per tenant being opened; other tenants never wait on it.
    opening: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionManager<PgBackend> {
    /// Connects to PostgreSQL; see [`ConnectionManager::initialize`].
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DbError> {
        Self::initialize(config, PgBackend).await
    }
}

impl<B: Backend> ConnectionManager<B> {
    /// Opens and pings the control database. No tenant can be served
    /// without it, so any failure here is returned and no manager exists.
    pub async fn initialize(config: &DatabaseConfig, backend: B) -> Result<Self, DbError> {
        let target = ConnectTarget {
            connection: config.control.clone(),
            pool: config.control_pool,
        };
        let control = open_verified(&backend, &target, config.ping_timeout).await?;
        info!(
            host = %config.control.host,
            database = %config.control.database,
            max_open = config.control_pool.max_open,
            "Control database connected"
        );

        Ok(Self {
            backend,
            control,
            control_database: config.control.database.clone(),
            tenant_template: config.tenant.clone(),
            tenant_pool: config.tenant_pool,
            ping_timeout: config.ping_timeout,
            tenants: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The control-database handle.
    pub fn control(&self) -> &B::Handle {
        &self.control
    }

    /// Returns a live pooled handle for an active tenant, opening one on
    /// first use.
    ///
    /// Cached handles are pinged before reuse; a handle that fails is evicted
    /// and replaced. Concurrent first callers for the same tenant queue on a
    /// per-tenant gate and share one pool. The registry lock is never held
    /// while a pool is being opened.
    pub async fn get_tenant_connection(&self, tenant_id: &str) -> Result<B::Handle, DbError> {
        self.ensure_open()?;

        if let Some(handle) = self.cached(tenant_id).await {
            return Ok(handle);
        }

        let tenant = resolver::resolve_active(&self.backend, &self.control, tenant_id).await?;

        let gate = self.opening_gate(tenant_id).await;
        let result = {
            let _opening = gate.lock().await;
            self.open_tenant(&tenant).await
        };
        self.release_gate(tenant_id, gate).await;
        result
    }

    async fn cached(&self, tenant_id: &str) -> Option<B::Handle> {
        let entry = self.tenants.read().await.get(tenant_id).cloned()?;
        match ping_handle(&self.backend, &entry.handle, &entry.database, self.ping_timeout).await {
            Ok(()) => {
                pool_event("reused");
                Some(entry.handle)
            }
            Err(e) => {
                warn!(tenant_id, database = %entry.database, error = %e, "Evicting stale tenant connection");
                self.evict_generation(tenant_id, entry.generation).await;
                None
            }
        }
    }

    /// Called with the tenant's gate held.
    async fn open_tenant(&self, tenant: &TenantRecord) -> Result<B::Handle, DbError> {
        let tenant_id = tenant.id.as_str();
        if let Some(entry) = self.tenants.read().await.get(tenant_id) {
            debug!(tenant_id, "Tenant connection opened concurrently, reusing it");
            pool_event("raced");
            return Ok(entry.handle.clone());
        }
        self.ensure_open()?;

        let target = self.tenant_target(&tenant.database_name);
        let handle = open_verified(&self.backend, &target, self.ping_timeout).await?;

        let mut tenants = self.tenants.write().await;
        if self.closed.load(Ordering::SeqCst) {
            drop(tenants);
            self.release(&tenant.database_name, &handle).await;
            return Err(DbError::Closed);
        }
        if let Some(entry) = tenants.get(tenant_id) {
            let winner = entry.handle.clone();
            drop(tenants);
            debug!(tenant_id, "Tenant connection replaced concurrently, closing ours");
            pool_event("raced");
            self.release(&tenant.database_name, &handle).await;
            return Ok(winner);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        tenants.insert(
            tenant_id.to_owned(),
            CachedHandle {
                handle: handle.clone(),
                database: tenant.database_name.clone(),
                generation,
            },
        );
        TENANT_POOLS_GAUGE.set(tenants.len() as f64);
        pool_event("opened");
        info!(
            tenant_id,
            database = %tenant.database_name,
            node = tenant.node_number,
            cached = tenants.len(),
            "Tenant connection opened"
        );
        Ok(handle)
    }

    async fn opening_gate(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.opening
            .lock()
            .await
            .entry(tenant_id.to_owned())
            .or_default()
            .clone()
    }

    async fn release_gate(&self, tenant_id: &str, gate: Arc<Mutex<()>>) {
        let mut opening = self.opening.lock().await;
        // The map and `gate` hold the only references: nobody is queued.
        if Arc::strong_count(&gate) == 2 {
            opening.remove(tenant_id);
        }
    }

    /// Opens an uncached tenant-tier handle on `database`. The caller owns
    /// it and must release it with [`ConnectionManager::release`].
    pub async fn open_database(&self, database: &str) -> Result<B::Handle, DbError> {
        self.ensure_open()?;
        validate_database_name(database)?;
        open_verified(&self.backend, &self.tenant_target(database), self.ping_timeout).await
    }

    /// Closes a handle obtained from [`ConnectionManager::open_database`].
    pub async fn release(&self, database: &str, handle: &B::Handle) {
        if let Err(e) = self.backend.close(handle).await {
            warn!(database, error = %e, "Failed to close database handle");
        }
    }

    /// Issues `CREATE DATABASE`. Not transactional: if a later step of the
    /// caller fails, the database must be dropped explicitly.
    pub async fn create_tenant_database(&self, name: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        validate_database_name(name)?;
        self.backend
            .create_database(&self.control, name)
            .await
            .map_err(|e| DbError::query(format!("create database {name}"), e))?;
        info!(database = name, "Tenant database created");
        Ok(())
    }

    /// Drops a tenant database.
    ///
    /// Our own cached pool is closed first, otherwise it would hold the
    /// database open and make the drop fail. Other sessions are then
    /// terminated best-effort before the drop itself.
    pub async fn drop_tenant_database(&self, tenant_id: &str, name: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        validate_database_name(name)?;

        self.evict_tenant(tenant_id).await;

        match self.backend.terminate_sessions(&self.control, name).await {
            Ok(0) => debug!(database = name, "No active sessions to terminate"),
            Ok(n) => info!(database = name, sessions = n, "Terminated active sessions"),
            Err(e) => warn!(database = name, error = %e, "Could not terminate sessions, dropping anyway"),
        }

        self.backend
            .drop_database(&self.control, name)
            .await
            .map_err(|e| DbError::query(format!("drop database {name}"), e))?;
        info!(tenant_id, database = name, "Tenant database dropped");
        Ok(())
    }

    /// Closes and forgets the cached handle for `tenant_id`, if any.
    /// Returns whether one was cached.
    pub async fn evict_tenant(&self, tenant_id: &str) -> bool {
        let removed = {
            let mut tenants = self.tenants.write().await;
            let removed = tenants.remove(tenant_id);
            TENANT_POOLS_GAUGE.set(tenants.len() as f64);
            removed
        };
        match removed {
            Some(entry) => {
                self.release(&entry.database, &entry.handle).await;
                pool_event("evicted");
                info!(tenant_id, database = %entry.database, "Tenant connection closed");
                true
            }
            None => false,
        }
    }

    /// Evicts every cached handle whose tenant is no longer `active` in the
    /// registry (or no longer exists). Registry lookup failures keep the
    /// entry. Returns the evicted tenant ids.
    pub async fn sweep_inactive(&self) -> Result<Vec<String>, DbError> {
        self.ensure_open()?;
        let mut evicted = Vec::new();
        for tenant_id in self.cached_tenant_ids().await {
            match resolver::lookup(&self.backend, &self.control, &tenant_id).await {
                Ok(Some(tenant)) if tenant.status.is_active() => {}
                Ok(found) => {
                    let status = found.map(|t| t.status.to_string());
                    info!(tenant_id = %tenant_id, status = ?status, "Tenant no longer active, closing its connection");
                    if self.evict_tenant(&tenant_id).await {
                        evicted.push(tenant_id);
                    }
                }
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "Could not check tenant status"),
            }
        }
        Ok(evicted)
    }

    /// Every tenant currently `active` in the registry.
    pub async fn active_tenants(&self) -> Result<Vec<TenantRecord>, DbError> {
        self.ensure_open()?;
        self.backend
            .list_active_tenants(&self.control)
            .await
            .map_err(|e| DbError::query("list active tenants", e))
    }

    pub async fn cached_tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pings the control database and reports how many tenant handles are
    /// cached. Tenant handles themselves are not pinged.
    pub async fn health_check(&self) -> Result<HealthReport, DbError> {
        self.ensure_open()?;
        ping_handle(&self.backend, &self.control, &self.control_database, self.ping_timeout).await?;
        Ok(HealthReport {
            tenant_connections: self.tenants.read().await.len(),
        })
    }

    /// Closes every tenant handle and then the control handle. Individual
    /// failures are counted, not short-circuited. Later calls are no-ops and
    /// every other operation fails with [`DbError::Closed`].
    pub async fn close_all(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let entries: Vec<(String, CachedHandle<B::Handle>)> = {
            let mut tenants = self.tenants.write().await;
            TENANT_POOLS_GAUGE.set(0.0);
            tenants.drain().collect()
        };

        let results = join_all(entries.iter().map(|(_, e)| self.backend.close(&e.handle))).await;
        let mut failed = 0;
        for ((tenant_id, entry), result) in entries.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                error!(tenant_id = %tenant_id, database = %entry.database, error = %e, "Failed to close tenant connection");
            }
        }
        if let Err(e) = self.backend.close(&self.control).await {
            failed += 1;
            error!(database = %self.control_database, error = %e, "Failed to close control connection");
        }
        pool_event("closed");

        let total = entries.len() + 1;
        if failed > 0 {
            return Err(DbError::CloseFailed { failed, total });
        }
        info!(total, "All database connections closed");
        Ok(())
    }

    // Journal access for the provisioning workflow.

    pub(crate) async fn record_provisioning(&self, record: &ProvisioningRecord) -> Result<(), DbError> {
        self.ensure_open()?;
        self.backend
            .record_provisioning(&self.control, record)
            .await
            .map_err(|e| DbError::query(format!("record provisioning of {}", record.tenant_id), e))
    }

    pub(crate) async fn pending_provisioning(&self) -> Result<Vec<ProvisioningRecord>, DbError> {
        self.ensure_open()?;
        self.backend
            .pending_provisioning(&self.control)
            .await
            .map_err(|e| DbError::query("list pending provisioning", e))
    }

    pub(crate) async fn delete_provisioning(&self, tenant_id: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        self.backend
            .delete_provisioning(&self.control, tenant_id)
            .await
            .map_err(|e| DbError::query(format!("delete provisioning of {tenant_id}"), e))
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }

    fn tenant_target(&self, database: &str) -> ConnectTarget {
        ConnectTarget {
            connection: self.tenant_template.with_database(database),
            pool: self.tenant_pool,
        }
    }

    /// Removes the entry only if it is still the one that was found stale;
    /// a concurrent caller may already have replaced it.
    async fn evict_generation(&self, tenant_id: &str, generation: u64) {
        let removed = {
            let mut tenants = self.tenants.write().await;
            if tenants.get(tenant_id).map(|e| e.generation) == Some(generation) {
                let removed = tenants.remove(tenant_id);
                TENANT_POOLS_GAUGE.set(tenants.len() as f64);
                removed
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            pool_event("evicted_stale");
            self.release(&entry.database, &entry.handle).await;
        }
    }
}

async fn ping_handle<B: Backend>(
    backend: &B,
    handle: &B::Handle,
    database: &str,
    timeout: Duration,
) -> Result<(), DbError> {
    match tokio::time::timeout(timeout, backend.ping(handle)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(DbError::Ping {
            database: database.to_owned(),
            source,
        }),
        Err(_) => Err(DbError::PingTimeout {
            database: database.to_owned(),
            timeout,
        }),
    }
}

/// Opens a handle and pings it. A handle that fails the ping is closed and
/// never returned.
async fn open_verified<B: Backend>(
    backend: &B,
    target: &ConnectTarget,
    ping_timeout: Duration,
) -> Result<B::Handle, DbError> {
    let database = target.database();
    let handle = backend.open(target).await.map_err(|source| DbError::Connect {
        database: database.to_owned(),
        source,
    })?;
    if let Err(e) = ping_handle(backend, &handle, database, ping_timeout).await {
        if let Err(close_err) = backend.close(&handle).await {
            warn!(database, error = %close_err, "Failed to close unverified handle");
        }
        return Err(e);
    }
    Ok(handle)
}
