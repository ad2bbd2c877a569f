use crate::config::AppConfig;
use crate::errors::AppError;
use metrics::{counter, gauge};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pool tuning for the storefront database
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    /// How long a request waits for a free connection
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            ..Default::default()
        }
    }
}

impl DbConfig {
    /// Each connection to `sqlite::memory:` opens its own empty database.
    fn is_in_memory_sqlite(&self) -> bool {
        self.url.starts_with("sqlite::memory:") || self.url.contains("mode=memory")
    }

    fn backend(&self) -> &str {
        self.url.split(':').next().unwrap_or("unknown")
    }
}

/// Opens the pool described by `config`.
pub async fn establish_connection_with_config(
    config: &DbConfig,
) -> Result<DatabaseConnection, AppError> {
    let mut max_connections = config.max_connections;
    let mut min_connections = config.min_connections;
    if config.is_in_memory_sqlite() && max_connections > 1 {
        warn!(
            requested = max_connections,
            "In-memory SQLite is limited to a single connection"
        );
        max_connections = 1;
        min_connections = min_connections.min(1);
    }
    debug!(backend = config.backend(), max_connections, "Configuring database pool");

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(max_connections)
        .min_connections(min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .sqlx_logging(false);

    gauge!("storefront_db.max_connections", max_connections as f64);

    let pool = Database::connect(opt).await.map_err(|e| {
        counter!("storefront_db.connection_failures", 1);
        AppError::DatabaseError(e)
    })?;
    info!(backend = config.backend(), "Database pool ready");
    Ok(pool)
}

pub async fn establish_connection_from_app_config(
    cfg: &AppConfig,
) -> Result<DatabaseConnection, AppError> {
    establish_connection_with_config(&DbConfig::from(cfg)).await
}

/// Applies any pending migrations from the embedded migrator.
pub async fn run_migrations(pool: &DatabaseConnection) -> Result<(), AppError> {
    let started = Instant::now();
    let pending = crate::migrator::Migrator::get_pending_migrations(pool)
        .await
        .map_err(AppError::DatabaseError)?
        .len();
    if pending == 0 {
        debug!("Schema is up to date");
        return Ok(());
    }

    info!(pending, "Applying database migrations");
    crate::migrator::Migrator::up(pool, None)
        .await
        .map_err(|e| {
            error!(elapsed = ?started.elapsed(), error = %e, "Database migrations failed");
            AppError::DatabaseError(e)
        })?;
    info!(pending, elapsed = ?started.elapsed(), "Database migrations applied");
    Ok(())
}

/// Readiness probe: pings the pool.
pub async fn check_connection(pool: &DatabaseConnection) -> Result<(), AppError> {
    pool.ping().await.map_err(|e| {
        error!(error = %e, "Database ping failed");
        counter!("storefront_db.connection_failures", 1);
        AppError::DatabaseError(e)
    })
}
