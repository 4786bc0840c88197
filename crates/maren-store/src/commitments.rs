//! Commitments and coherence records.

use chrono::{DateTime, Utc};
use sqlx::Row;

use maren_core::{
    CoherenceRecord, Commitment, CommitmentId, CommitmentStatus, InteractionId, UserId,
};

use crate::db::Store;
use crate::error::{StoreError, StoreResult};

fn row_to_commitment(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Commitment> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(Commitment {
        id: id
            .parse()
            .map_err(|_| StoreError::NotFound(format!("bad commitment id {id}")))?,
        user_id: UserId(row.try_get("user_id")?),
        text: row.try_get("text")?,
        target_ts: row.try_get("target_ts")?,
        status: status.parse().map_err(StoreError::NotFound)?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Persist a commitment extracted by coherence analysis.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn insert_commitment(
        &self,
        user_id: UserId,
        text: &str,
        target_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Commitment> {
        let commitment = Commitment {
            id: CommitmentId::new(),
            user_id,
            text: text.to_owned(),
            target_ts,
            status: CommitmentStatus::Active,
            created_at: now,
        };
        self.timed(async {
            sqlx::query(
                "INSERT INTO commitments (id, user_id, text, target_ts, status, created_at)
                 VALUES (?, ?, ?, ?, 'active', ?)",
            )
            .bind(commitment.id.to_string())
            .bind(commitment.user_id.0)
            .bind(&commitment.text)
            .bind(commitment.target_ts)
            .bind(commitment.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        Ok(commitment)
    }

    /// Active commitments for a user with a target inside the horizon:
    /// the working set of a coherence check.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn active_commitments_within(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        horizon: chrono::Duration,
    ) -> StoreResult<Vec<Commitment>> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT * FROM commitments
                 WHERE user_id = ? AND status = 'active' AND deleted_at IS NULL
                   AND target_ts >= ? AND target_ts <= ?
                 ORDER BY target_ts",
            )
            .bind(user_id.0)
            .bind(now)
            .bind(now + horizon)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_commitment).collect()
        })
        .await
    }

    /// Soft-expire active commitments whose target time has passed.
    /// Returns how many were expired; the janitor runs this.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn expire_due_commitments(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE commitments SET status = 'expired', deleted_at = ?
                 WHERE status = 'active' AND target_ts < ?",
            )
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Record a coherence verdict for an interaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn insert_coherence_record(&self, record: &CoherenceRecord) -> StoreResult<()> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO coherence_records
                 (interaction_id, status, original_span, replacement_span,
                  new_commitments, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(record.interaction_id.to_string())
            .bind(record.status.as_str())
            .bind(&record.original_span)
            .bind(&record.replacement_span)
            .bind(i64::from(record.new_commitments))
            .bind(record.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_insert(e, "coherence record"))?;
            Ok(())
        })
        .await
    }

    /// Fetch the coherence record for an interaction, if the check ran.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn coherence_record(
        &self,
        interaction_id: InteractionId,
    ) -> StoreResult<Option<CoherenceRecord>> {
        self.timed(async {
            let row = sqlx::query("SELECT * FROM coherence_records WHERE interaction_id = ?")
                .bind(interaction_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            row.map(|row| {
                let status: String = row.try_get("status")?;
                let new_commitments: i64 = row.try_get("new_commitments")?;
                Ok(CoherenceRecord {
                    interaction_id,
                    status: status.parse().map_err(StoreError::NotFound)?,
                    original_span: row.try_get("original_span")?,
                    replacement_span: row.try_get("replacement_span")?,
                    new_commitments: u32::try_from(new_commitments).unwrap_or(0),
                    created_at: row.try_get("created_at")?,
                })
            })
            .transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use maren_core::CoherenceStatus;

    #[tokio::test]
    async fn test_horizon_filtering() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_commitment(UserId(1), "anatomy exam tomorrow 9am", now + Duration::hours(18), now)
            .await
            .unwrap();
        store
            .insert_commitment(UserId(1), "trip next month", now + Duration::days(30), now)
            .await
            .unwrap();
        store
            .insert_commitment(UserId(2), "someone else's", now + Duration::hours(1), now)
            .await
            .unwrap();

        let within = store
            .active_commitments_within(UserId(1), now, Duration::days(7))
            .await
            .unwrap();
        assert_eq!(within.len(), 1);
        assert_eq!(within[0].text, "anatomy exam tomorrow 9am");
    }

    #[tokio::test]
    async fn test_expiry_soft_deletes() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_commitment(UserId(1), "call at noon", now - Duration::hours(2), now)
            .await
            .unwrap();
        let expired = store.expire_due_commitments(now).await.unwrap();
        assert_eq!(expired, 1);
        let within = store
            .active_commitments_within(UserId(1), now - Duration::days(1), Duration::days(7))
            .await
            .unwrap();
        assert!(within.is_empty());
    }

    #[tokio::test]
    async fn test_coherence_record_roundtrip() {
        let store = Store::connect_memory().await.unwrap();
        let record = CoherenceRecord {
            interaction_id: InteractionId::new(),
            status: CoherenceStatus::AvailabilityConflict,
            original_span: Some("tomorrow at 9".to_string()),
            replacement_span: Some("tomorrow after 11".to_string()),
            new_commitments: 1,
            created_at: Utc::now(),
        };
        store.insert_coherence_record(&record).await.unwrap();
        let fetched = store
            .coherence_record(record.interaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, CoherenceStatus::AvailabilityConflict);
        assert_eq!(fetched.replacement_span.as_deref(), Some("tomorrow after 11"));
    }
}
