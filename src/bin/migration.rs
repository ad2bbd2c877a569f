use sea_orm_migration::prelude::*;
use storefront_payments::{config, db, migrator::Migrator};
use tracing::{error, info};

/// Applies (`up`, the default) or rolls back (`down`) the embedded migrations.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let direction = std::env::args().nth(1).unwrap_or_else(|| "up".to_string());
    info!(%direction, "Starting database migration");

    let pool = db::establish_connection_from_app_config(&cfg).await?;
    let result = match direction.as_str() {
        "up" => Migrator::up(&pool, None).await,
        "down" => Migrator::down(&pool, None).await,
        "status" => Migrator::status(&pool).await,
        other => {
            error!("Unknown migration command '{}'; expected up, down or status", other);
            return Err(format!("unknown migration command: {}", other).into());
        }
    };

    result.map_err(|e| {
        error!("Migration failed: {}", e);
        e
    })?;

    info!("Migration completed successfully");
    Ok(())
}
