//! PostgreSQL connection pool for the fleet store.

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;

use crate::error::AppResult;

pub type DbPool = sqlx::PgPool;

/// Connect and make sure the fleet tables are reachable before serving.
///
/// The watcher reads the store on every tick; a small pool is enough.
pub async fn create_pool(database_url: &str) -> AppResult<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    sqlx::query("SELECT 1 FROM trips LIMIT 1")
        .execute(&pool)
        .await?;
    info!(max_connections = 5, "fleet store pool ready");
    Ok(pool)
}
