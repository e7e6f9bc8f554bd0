use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::{DatabaseSettings, EngineSettings};

/// Build the connection pool.
///
/// Connections are established lazily so the server (and its health
/// endpoint) comes up even while the database is still unreachable.
pub fn create_pool(
    database: &DatabaseSettings,
    engine: &EngineSettings,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(engine.max_connections())
        .acquire_timeout(engine.pool_timeout)
        .connect_lazy(&database.url())
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// One cheap round trip; the health endpoint reports 503 when it fails.
pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
