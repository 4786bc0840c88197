//! Recovery operation rows.

use sqlx::Row;

use maren_core::{RecoveryOperation, RecoveryOpId, UserId};

use crate::db::Store;
use crate::error::{StoreError, StoreResult};

fn row_to_op(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RecoveryOperation> {
    let id: String = row.try_get("id")?;
    let trigger: String = row.try_get("trigger_kind")?;
    let status: String = row.try_get("status")?;
    let errors: String = row.try_get("errors")?;
    let count = |name: &str| -> StoreResult<u32> {
        let value: i64 = row.try_get(name)?;
        Ok(u32::try_from(value).unwrap_or(0))
    };
    Ok(RecoveryOperation {
        id: id
            .parse()
            .map_err(|_| StoreError::NotFound(format!("bad recovery op id {id}")))?,
        trigger: trigger.parse().map_err(StoreError::NotFound)?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        tier1_count: count("tier1_count")?,
        tier2_count: count("tier2_count")?,
        tier3_count: count("tier3_count")?,
        skipped_count: count("skipped_count")?,
        users_examined: count("users_examined")?,
        errors: serde_json::from_str(&errors)?,
        status: status.parse().map_err(StoreError::NotFound)?,
    })
}

impl Store {
    /// Insert a freshly started recovery operation.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn insert_recovery_op(&self, op: &RecoveryOperation) -> StoreResult<()> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO recovery_operations (id, trigger_kind, started_at, status)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(op.id.to_string())
            .bind(op.trigger.as_str())
            .bind(op.started_at)
            .bind(op.status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_insert(e, "recovery operation"))?;
            Ok(())
        })
        .await
    }

    /// Write back counters, errors, and terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn update_recovery_op(&self, op: &RecoveryOperation) -> StoreResult<()> {
        let errors = serde_json::to_string(&op.errors)?;
        self.timed(async {
            let result = sqlx::query(
                "UPDATE recovery_operations
                 SET finished_at = ?, tier1_count = ?, tier2_count = ?, tier3_count = ?,
                     skipped_count = ?, users_examined = ?, errors = ?, status = ?
                 WHERE id = ?",
            )
            .bind(op.finished_at)
            .bind(i64::from(op.tier1_count))
            .bind(i64::from(op.tier2_count))
            .bind(i64::from(op.tier3_count))
            .bind(i64::from(op.skipped_count))
            .bind(i64::from(op.users_examined))
            .bind(&errors)
            .bind(op.status.as_str())
            .bind(op.id.to_string())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("recovery op {}", op.id)));
            }
            Ok(())
        })
        .await
    }

    /// The most recently started operation, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn latest_recovery_op(&self) -> StoreResult<Option<RecoveryOperation>> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT * FROM recovery_operations ORDER BY started_at DESC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(row_to_op).transpose()
        })
        .await
    }

    /// Fetch one operation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn get_recovery_op(&self, id: RecoveryOpId) -> StoreResult<RecoveryOperation> {
        self.timed(async {
            let row = sqlx::query("SELECT * FROM recovery_operations WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("recovery op {id}")))?;
            row_to_op(&row)
        })
        .await
    }

    /// Recent operations, newest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn recovery_history(&self, limit: i64) -> StoreResult<Vec<RecoveryOperation>> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT * FROM recovery_operations ORDER BY started_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_op).collect()
        })
        .await
    }

    /// Recovered-interaction count for a user (test and metrics helper).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn recovered_interaction_count(&self, user_id: UserId) -> StoreResult<u64> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n FROM interactions
                 WHERE user_id = ? AND is_recovered = 1",
            )
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
            let n: i64 = row.try_get("n")?;
            #[allow(clippy::cast_sign_loss)]
            Ok(n as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maren_core::{RecoveryStatus, RecoveryTrigger};

    #[tokio::test]
    async fn test_lifecycle_roundtrip() {
        let store = Store::connect_memory().await.unwrap();
        let mut op = RecoveryOperation::begin(RecoveryTrigger::Startup, Utc::now());
        store.insert_recovery_op(&op).await.unwrap();

        op.tier1_count = 2;
        op.skipped_count = 1;
        op.users_examined = 3;
        op.errors.push("history fetch failed for 42".to_string());
        op.finished_at = Some(Utc::now());
        op.status = RecoveryStatus::Completed;
        store.update_recovery_op(&op).await.unwrap();

        let fetched = store.get_recovery_op(op.id).await.unwrap();
        assert_eq!(fetched.tier1_count, 2);
        assert_eq!(fetched.skipped_count, 1);
        assert_eq!(fetched.status, RecoveryStatus::Completed);
        assert_eq!(fetched.errors.len(), 1);
        assert_eq!(fetched.ingested_total(), 2);

        let latest = store.latest_recovery_op().await.unwrap().unwrap();
        assert_eq!(latest.id, op.id);
        assert_eq!(store.recovery_history(10).await.unwrap().len(), 1);
    }
}
