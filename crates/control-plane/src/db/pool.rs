//! Connection pool for the PostgreSQL adapters.

use std::time::{Duration, Instant};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

pub type DbPool = PgPool;

/// Open a pool against the configured target.
///
/// # Errors
///
/// Returns an error if the settings are invalid or no connection can be made.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(config.connect_options()?)
        .await?;

    tracing::info!(
        db_target = %config.target(),
        application_name = %config.application_name,
        max_connections = config.max_connections,
        statement_timeout_ms = config.statement_timeout_ms,
        "Database pool ready"
    );
    Ok(pool)
}

/// Round-trip time of a trivial query, or the error that stopped it.
pub async fn health_check(pool: &DbPool) -> Result<Duration, sqlx::Error> {
    let started = Instant::now();
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(started.elapsed())
}
