use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::connect_url;

    const MANAGED_TABLES: &[&str] = &[
        "artist",
        "genre",
        "album",
        "track",
        "employee",
        "customer",
        "invoice",
        "invoice_line",
        "conversation",
        "message",
        "suspension",
    ];

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in MANAGED_TABLES {
            let count = sqlx::query(
                "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("check table")
            .get::<i64, _>("count");
            assert_eq!(count, 1, "expected table `{table}` to exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run");
    }
}
