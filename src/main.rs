/// Operator tool for tenant databases.
///
/// Usage: tenantdb <COMMAND>
///   migrate [--tenant ID | --all-tenants]   apply pending migrations
///   rollback [--tenant ID] [--steps N]      revert applied migrations
///   version [--tenant ID]                   show the migration version
///   force [--tenant ID] <VERSION|none>      clear a dirty migration state
///   provision <TENANT_ID> <DATABASE>        create + migrate a tenant database
///   drop <TENANT_ID> <DATABASE>             drop a tenant database
///   reconcile                               clean up interrupted provisioning
///   health                                  ping the control database
///   metrics                                 print pool metrics
///   watch                                   sweep deactivated tenants until Ctrl-C
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenantdb::config::Config;
use tenantdb::db::migrate::{tenant_logical_name, CONTROL_DATABASE};
use tenantdb::db::{self, ConnectionManager, MigrationRunner, PgBackend};
use tenantdb::services::{metrics, provisioning::ProvisioningService, tenant_sweeper};

#[derive(Parser)]
#[command(name = "tenantdb", about = "Tenant database connectivity and provisioning tool")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations (control database unless --tenant is given)
    Migrate {
        #[arg(long, conflicts_with = "all_tenants")]
        tenant: Option<String>,
        /// Migrate every active tenant database
        #[arg(long)]
        all_tenants: bool,
    },
    /// Revert the most recent migrations
    Rollback {
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
    /// Show the current migration version
    Version {
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Record a version as clean after repairing a failed migration by hand
    Force {
        #[arg(long)]
        tenant: Option<String>,
        /// Version to record, or "none" to forget the database
        version: String,
    },
    /// Create and migrate a new tenant database
    Provision { tenant_id: String, database: String },
    /// Drop a tenant database
    Drop { tenant_id: String, database: String },
    /// Drop databases left behind by interrupted provisioning runs
    Reconcile,
    /// Ping the control database
    Health,
    /// Print connection pool metrics in Prometheus format
    Metrics,
    /// Periodically close connections of deactivated tenants until interrupted
    Watch,
}

impl Command {
    /// Commands that provision or serve tenants first clean up runs a
    /// previous process left unfinished.
    fn reconciles_on_startup(&self) -> bool {
        matches!(self, Command::Provision { .. } | Command::Drop { .. } | Command::Watch)
    }
}

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let manager = ConnectionManager::connect(&config.database)
        .await
        .context("Control database unavailable")?;

    if args.command.reconciles_on_startup() {
        let service = ProvisioningService::new(&manager, &config.tenant_migrations_dir);
        let reconciled = service.reconcile_on_startup().await;
        if !reconciled.is_empty() {
            info!("Reconciled {} interrupted provisioning run(s) on startup", reconciled.len());
        }
    }

    let manager = Arc::new(manager);
    let result = run(&manager, &config, args.command).await;
    if let Err(e) = manager.close_all().await {
        tracing::warn!("Shutdown: {e}");
    }
    result
}

async fn watch(manager: Arc<ConnectionManager<PgBackend>>, config: &Config) -> anyhow::Result<()> {
    let every = config.tenant_sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL);
    info!("Sweeping deactivated tenants every {}s", every.as_secs());
    let sweeper = tenant_sweeper::start(manager.clone(), every);

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, closing connections");
    manager.close_all().await?;
    sweeper.abort();
    Ok(())
}

async fn run(
    shared: &Arc<ConnectionManager<PgBackend>>,
    config: &Config,
    command: Command,
) -> anyhow::Result<()> {
    let manager: &ConnectionManager<PgBackend> = shared;
    let target = |tenant: Option<String>| -> (Option<String>, String, PathBuf) {
        match tenant {
            Some(id) => {
                let logical = tenant_logical_name(&id);
                (Some(id), logical, config.tenant_migrations_dir.clone())
            }
            None => (
                None,
                CONTROL_DATABASE.to_owned(),
                config.control_migrations_dir.clone(),
            ),
        }
    };

    match command {
        Command::Migrate { tenant: None, all_tenants: true } => {
            let failed = db::migrate_all_existing_tenants(manager, &config.tenant_migrations_dir).await?;
            if !failed.is_empty() {
                anyhow::bail!("Migration failed for {} tenant(s): {}", failed.len(), failed.join(", "));
            }
        }
        Command::Migrate { tenant, .. } => {
            let (tenant, logical, dir) = target(tenant);
            let outcome = match tenant {
                Some(id) => {
                    let handle = manager.get_tenant_connection(&id).await?;
                    MigrationRunner::run_migrations(&handle, &logical, &dir).await?
                }
                None => db::run_control_migrations(manager, &dir).await?,
            };
            print_json(&outcome)?;
        }
        Command::Rollback { tenant, steps } => {
            let (tenant, logical, dir) = target(tenant);
            let outcome = match tenant {
                Some(id) => {
                    let handle = manager.get_tenant_connection(&id).await?;
                    MigrationRunner::rollback(&handle, &logical, &dir, steps).await?
                }
                None => MigrationRunner::rollback(manager.control(), &logical, &dir, steps).await?,
            };
            print_json(&outcome)?;
        }
        Command::Version { tenant } => {
            let (tenant, logical, dir) = target(tenant);
            let version = match tenant {
                Some(id) => {
                    let handle = manager.get_tenant_connection(&id).await?;
                    MigrationRunner::get_version(&handle, &logical, &dir).await?
                }
                None => MigrationRunner::get_version(manager.control(), &logical, &dir).await?,
            };
            print_json(&version)?;
        }
        Command::Force { tenant, version } => {
            let version = match version.as_str() {
                "none" => None,
                v => Some(v.parse::<i64>().context("VERSION must be an integer or \"none\"")?),
            };
            let (tenant, logical, dir) = target(tenant);
            match tenant {
                Some(id) => {
                    let handle = manager.get_tenant_connection(&id).await?;
                    MigrationRunner::force_version(&handle, &logical, &dir, version).await?
                }
                None => MigrationRunner::force_version(manager.control(), &logical, &dir, version).await?,
            }
        }
        Command::Provision { tenant_id, database } => {
            let service = ProvisioningService::new(manager, &config.tenant_migrations_dir);
            let outcome = service.provision(&tenant_id, &database).await?;
            print_json(&outcome)?;
        }
        Command::Drop { tenant_id, database } => {
            let service = ProvisioningService::new(manager, &config.tenant_migrations_dir);
            service.deprovision(&tenant_id, &database).await?;
            info!("Dropped {database} for tenant {tenant_id}");
        }
        Command::Reconcile => {
            let service = ProvisioningService::new(manager, &config.tenant_migrations_dir);
            let reconciled = service.reconcile().await?;
            print_json(&reconciled)?;
        }
        Command::Health => {
            let report = manager.health_check().await?;
            print_json(&report)?;
        }
        Command::Metrics => {
            print!("{}", metrics::render()?);
        }
        Command::Watch => watch(shared.clone(), config).await?,
    }
    Ok(())
}
