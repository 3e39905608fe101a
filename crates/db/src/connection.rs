use std::time::Duration;

use aisle_core::config::DatabaseConfig;
use sqlx::sqlite::SqlitePoolOptions;

pub type DbPool = sqlx::SqlitePool;

const MEMORY_URL: &str = "sqlite::memory:";

pub async fn connect_from_config(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// Opens a pool with WAL journaling and a busy timeout on every connection.
///
/// In-memory databases live as long as their single connection, so they get a pool of one
/// connection that is never recycled.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let in_memory = database_url == ":memory:" || database_url == MEMORY_URL;
    let url = if in_memory { MEMORY_URL } else { database_url };

    let mut options =
        SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(timeout_secs.max(1)));
    options = if in_memory {
        options.max_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        options.max_connections(max_connections.max(1))
    };

    options
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

/// Round-trips a trivial statement; used by the health endpoint.
pub async fn ping(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}
