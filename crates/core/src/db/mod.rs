pub mod repository;
pub mod sqlite;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

pub enum DatabasePool {
    Sqlite(SqlitePool),
}

impl DatabasePool {
    /// Create a new SQLite database pool from a file path and run migrations.
    pub async fn new_sqlite(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::run_migrations(&pool).await?;
        Ok(DatabasePool::Sqlite(pool))
    }

    /// Create a new in-memory SQLite database pool and run migrations. Useful for testing.
    ///
    /// All connections of the pool share one database.
    pub async fn new_sqlite_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::run_migrations(&pool).await?;
        Ok(DatabasePool::Sqlite(pool))
    }

    pub fn sqlite(&self) -> &SqlitePool {
        match self {
            DatabasePool::Sqlite(pool) => pool,
        }
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(pool)
            .await?;

        let migrations: &[&str] =
            &[include_str!("../../../../migrations/sqlite/001_initial_schema.sql")];

        for migration_sql in migrations {
            for statement in migration_sql.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() && !trimmed.starts_with("PRAGMA") {
                    sqlx::query(trimmed).execute(pool).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_runs_migrations() {
        let db = DatabasePool::new_sqlite_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'grouping'",
        )
        .fetch_one(db.sqlite())
        .await
        .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn migrations_are_rerunnable() {
        let db = DatabasePool::new_sqlite_memory().await.unwrap();
        DatabasePool::run_migrations(db.sqlite()).await.unwrap();
    }
}
