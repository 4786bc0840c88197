//! Connection handling and the [`Store`] handle.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Embedded schema migrations, applied in order at connect time.
const MIGRATIONS: &[(&str, &str)] = &[("0001_init", include_str!("../migrations/0001_init.sql"))];

/// Handle to the message store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) timeout: Duration,
}

impl Store {
    /// Open (creating if needed) a file-backed store and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] when the database cannot be
    /// opened or migrated.
    pub async fn connect(path: &str, timeout: Duration) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(timeout)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { pool, timeout };
        store.migrate().await?;
        info!(path, "message store ready");
        Ok(store)
    }

    /// Open an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] when the database cannot be
    /// opened or migrated.
    pub async fn connect_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        // A single connection: every pool handle must see the same
        // in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            pool,
            timeout: Duration::from_secs(5),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))?;

        for (name, sql) in MIGRATIONS {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM schema_migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
            if applied.is_some() {
                continue;
            }
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            for statement in split_statements(sql) {
                sqlx::query(&statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Connection(format!("migration {name}: {e}")))?;
            }
            sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)")
                .bind(name)
                .bind(chrono::Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            tx.commit()
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            info!(migration = name, "applied migration");
        }
        Ok(())
    }

    /// Run a store future under the configured timeout.
    pub(crate) async fn timed<T>(
        &self,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Split a migration file into individual statements. Good enough for our
/// own migration files: statements end with `;` at end of line and the
/// schema contains no string literals with semicolons.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.lines().all(|l| l.trim_start().starts_with("--")))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_applies_migrations() {
        let store = Store::connect_memory().await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM edit_taxonomy")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert!(count >= 10);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = Store::connect_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maren.db");
        let store = Store::connect(&path.display().to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_split_statements_drops_comment_only_chunks() {
        let statements = split_statements("-- header\nCREATE TABLE t (a);\n\nINSERT INTO t (a) VALUES (1);\n");
        assert_eq!(statements.len(), 2);
    }
}
