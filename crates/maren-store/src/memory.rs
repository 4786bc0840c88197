//! Raw conversation-memory rows.
//!
//! The memory manager owns the budgets and compression policy; the store
//! only provides ordered rows and the primitives the policy needs.

use chrono::{DateTime, Utc};
use sqlx::Row;

use maren_core::UserId;

use crate::db::Store;
use crate::error::StoreResult;

/// One memory row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRow {
    /// Row id (insertion order).
    pub id: i64,
    /// `"user"`, `"assistant"`, or `"summary"`.
    pub role: String,
    /// Entry text.
    pub text: String,
    /// Entry timestamp.
    pub ts: DateTime<Utc>,
}

fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> StoreResult<MemoryRow> {
    Ok(MemoryRow {
        id: row.try_get("id")?,
        role: row.try_get("role")?,
        text: row.try_get("text")?,
        ts: row.try_get("ts")?,
    })
}

impl Store {
    /// Append a memory entry.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn append_memory(
        &self,
        user_id: UserId,
        role: &str,
        text: &str,
        ts: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.timed(async {
            sqlx::query("INSERT INTO memory_entries (user_id, role, text, ts) VALUES (?, ?, ?, ?)")
                .bind(user_id.0)
                .bind(role)
                .bind(text)
                .bind(ts)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// All memory rows for a user, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn memory_rows(&self, user_id: UserId) -> StoreResult<Vec<MemoryRow>> {
        self.timed(async {
            let rows = sqlx::query("SELECT * FROM memory_entries WHERE user_id = ? ORDER BY id")
                .bind(user_id.0)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(row_to_memory).collect()
        })
        .await
    }

    /// Last `k` memory rows for a user, oldest-of-the-window first.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn recent_memory(&self, user_id: UserId, k: i64) -> StoreResult<Vec<MemoryRow>> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT * FROM (
                     SELECT * FROM memory_entries WHERE user_id = ? ORDER BY id DESC LIMIT ?
                 ) ORDER BY id",
            )
            .bind(user_id.0)
            .bind(k)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_memory).collect()
        })
        .await
    }

    /// Delete specific memory rows (compression).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn delete_memory_rows(&self, ids: &[i64]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.timed(async {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!("DELETE FROM memory_entries WHERE id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(id);
            }
            query.execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    /// Erase every memory row for a user (privacy request).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn forget_memory(&self, user_id: UserId) -> StoreResult<u64> {
        self.timed(async {
            let result = sqlx::query("DELETE FROM memory_entries WHERE user_id = ?")
                .bind(user_id.0)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Drop memory for users whose newest entry is older than the cutoff
    /// (inactivity TTL). Returns affected row count.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn prune_inactive_memory(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.timed(async {
            let result = sqlx::query(
                "DELETE FROM memory_entries WHERE user_id IN (
                     SELECT user_id FROM memory_entries GROUP BY user_id HAVING MAX(ts) < ?
                 )",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_append_and_recent_window() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        for i in 0..5 {
            store
                .append_memory(UserId(1), "user", &format!("m{i}"), now)
                .await
                .unwrap();
        }
        let recent = store.recent_memory(UserId(1), 2).await.unwrap();
        let texts: Vec<&str> = recent.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn test_forget_erases_everything() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store.append_memory(UserId(1), "user", "a", now).await.unwrap();
        store.append_memory(UserId(2), "user", "b", now).await.unwrap();
        assert_eq!(store.forget_memory(UserId(1)).await.unwrap(), 1);
        assert!(store.memory_rows(UserId(1)).await.unwrap().is_empty());
        assert_eq!(store.memory_rows(UserId(2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inactivity_prune() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .append_memory(UserId(1), "user", "old", now - Duration::days(40))
            .await
            .unwrap();
        store.append_memory(UserId(2), "user", "fresh", now).await.unwrap();
        let pruned = store
            .prune_inactive_memory(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.memory_rows(UserId(1)).await.unwrap().is_empty());
        assert_eq!(store.memory_rows(UserId(2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_specific_rows() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store.append_memory(UserId(1), "user", "a", now).await.unwrap();
        store.append_memory(UserId(1), "assistant", "b", now).await.unwrap();
        let rows = store.memory_rows(UserId(1)).await.unwrap();
        store.delete_memory_rows(&[rows[0].id]).await.unwrap();
        let rows = store.memory_rows(UserId(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "b");
    }
}
