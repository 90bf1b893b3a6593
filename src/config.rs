use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// TLS negotiation mode for a database connection (libpq `sslmode` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(anyhow::anyhow!("Unknown TLS mode: {other}")),
        }
    }
}

/// Where to reach one database. For the tenant tier this is a template:
/// `database` is replaced per call with the tenant's own database name.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: SslMode,
}

impl ConnectionConfig {
    pub fn with_database(&self, database: &str) -> Self {
        Self {
            database: database.to_owned(),
            ..self.clone()
        }
    }
}

// Hand-written so the password never ends up in logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"********")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Pool sizing for one tier (control or tenant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u32,
    /// Idle connections the pool keeps warm.
    pub min_idle: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl PoolSettings {
    pub fn control_defaults() -> Self {
        Self {
            max_open: 25,
            min_idle: 2,
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
        }
    }

    pub fn tenant_defaults() -> Self {
        Self {
            max_open: 10,
            min_idle: 0,
            ..Self::control_defaults()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub control: ConnectionConfig,
    pub tenant: ConnectionConfig,
    pub control_pool: PoolSettings,
    pub tenant_pool: PoolSettings,
    /// Upper bound on a single liveness ping.
    pub ping_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub control_migrations_dir: PathBuf,
    pub tenant_migrations_dir: PathBuf,
    /// Interval of the inactive-tenant sweep; `None` disables it.
    pub tenant_sweep_interval: Option<Duration>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|s| !s.is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| anyhow::anyhow!("Missing required env var: {}", key))
        };

        let control = ConnectionConfig {
            host: required("CONTROL_DB_HOST")?,
            port: var("CONTROL_DB_PORT")
                .unwrap_or_else(|| "5432".into())
                .parse()?,
            database: required("CONTROL_DB_NAME")?,
            user: required("CONTROL_DB_USER")?,
            password: var("CONTROL_DB_PASSWORD").unwrap_or_default(),
            ssl_mode: var("CONTROL_DB_SSLMODE")
                .unwrap_or_else(|| "disable".into())
                .parse()?,
        };

        // Tenant databases live on the control cluster unless told otherwise.
        let tenant = ConnectionConfig {
            host: var("TENANT_DB_HOST").unwrap_or_else(|| control.host.clone()),
            port: match var("TENANT_DB_PORT") {
                Some(p) => p.parse()?,
                None => control.port,
            },
            database: control.database.clone(),
            user: var("TENANT_DB_USER").unwrap_or_else(|| control.user.clone()),
            password: var("TENANT_DB_PASSWORD").unwrap_or_else(|| control.password.clone()),
            ssl_mode: match var("TENANT_DB_SSLMODE") {
                Some(m) => m.parse()?,
                None => control.ssl_mode,
            },
        };

        let secs = |key: &str, default: u64| -> anyhow::Result<Duration> {
            Ok(Duration::from_secs(match var(key) {
                Some(v) => v.parse()?,
                None => default,
            }))
        };
        let count = |key: &str, default: u32| -> anyhow::Result<u32> {
            Ok(match var(key) {
                Some(v) => v.parse()?,
                None => default,
            })
        };

        let max_lifetime = secs("DB_CONN_MAX_LIFETIME_SECS", 1800)?;
        let idle_timeout = secs("DB_CONN_MAX_IDLE_SECS", 300)?;
        let acquire_timeout = secs("DB_ACQUIRE_TIMEOUT_SECS", 5)?;

        let control_defaults = PoolSettings::control_defaults();
        let tenant_defaults = PoolSettings::tenant_defaults();
        let control_pool = PoolSettings {
            max_open: count("CONTROL_POOL_MAX_OPEN", control_defaults.max_open)?,
            min_idle: count("CONTROL_POOL_MIN_IDLE", control_defaults.min_idle)?,
            max_lifetime,
            idle_timeout,
            acquire_timeout,
        };
        let tenant_pool = PoolSettings {
            max_open: count("TENANT_POOL_MAX_OPEN", tenant_defaults.max_open)?,
            min_idle: count("TENANT_POOL_MIN_IDLE", tenant_defaults.min_idle)?,
            max_lifetime,
            idle_timeout,
            acquire_timeout,
        };

        if control_pool.max_open == 0 || tenant_pool.max_open == 0 {
            anyhow::bail!("Pool max open connections must be at least 1");
        }
        if tenant_pool.max_open > control_pool.max_open {
            anyhow::bail!(
                "TENANT_POOL_MAX_OPEN ({}) must not exceed CONTROL_POOL_MAX_OPEN ({})",
                tenant_pool.max_open,
                control_pool.max_open
            );
        }

        let tenant_sweep_interval = match var("TENANT_SWEEP_INTERVAL_SECS") {
            Some(v) => Some(Duration::from_secs(v.parse()?)).filter(|d| !d.is_zero()),
            None => None,
        };

        Ok(Self {
            database: DatabaseConfig {
                control,
                tenant,
                control_pool,
                tenant_pool,
                ping_timeout: secs("DB_PING_TIMEOUT_SECS", 5)?,
            },
            control_migrations_dir: var("CONTROL_MIGRATIONS_DIR")
                .unwrap_or_else(|| "./migrations/control".into())
                .into(),
            tenant_migrations_dir: var("MIGRATIONS_DIR")
                .unwrap_or_else(|| "./migrations/tenant".into())
                .into(),
            tenant_sweep_interval,
        })
    }
}
