use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

use tunesmith_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

// Invoice-line deletes must cascade from their parent invoice, and
// concurrent writers wait out short lock contention instead of erroring.
const SESSION_PRAGMAS: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    "PRAGMA journal_mode = WAL",
    "PRAGMA busy_timeout = 5000",
];

/// Opens the pool described by the `[database]` section of the app config.
pub async fn connect(database: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(database.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(database.timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                for pragma in SESSION_PRAGMAS {
                    sqlx::query(pragma).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(&database.url)
        .await
}

/// Single-connection pool for tests and one-off tools that carry a bare URL
/// rather than a full config.
pub async fn connect_url(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect(&DatabaseConfig {
        url: database_url.to_string(),
        max_connections: 1,
        timeout_secs: 30,
    })
    .await
}
