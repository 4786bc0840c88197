//! Quarantine entries.

use chrono::{DateTime, Utc};
use sqlx::Row;

use maren_core::{IntakeEntry, PlatformMessageId, QuarantineEntry, QuarantineEntryId, UserId};

use crate::cursors::MessageLocation;
use crate::db::Store;
use crate::error::{StoreError, StoreResult};

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> StoreResult<QuarantineEntry> {
    let id: String = row.try_get("id")?;
    Ok(QuarantineEntry {
        id: id
            .parse()
            .map_err(|_| StoreError::NotFound(format!("bad quarantine id {id}")))?,
        user_id: UserId(row.try_get("user_id")?),
        platform_message_id: PlatformMessageId(row.try_get("platform_message_id")?),
        text: row.try_get("text")?,
        quarantined_at: row.try_get("quarantined_at")?,
        processed: row.try_get("processed")?,
        released_at: row.try_get("released_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

impl Store {
    /// Park a message in quarantine, claiming its id in the exclusivity
    /// index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the (user, message) pair was
    /// already ingested anywhere.
    pub async fn insert_quarantine(
        &self,
        user_id: UserId,
        message_id: PlatformMessageId,
        text: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<QuarantineEntry> {
        self.claim_message(user_id, message_id, MessageLocation::Quarantine, now)
            .await?;
        let entry = QuarantineEntry {
            id: QuarantineEntryId::new(),
            user_id,
            platform_message_id: message_id,
            text: text.to_owned(),
            quarantined_at: now,
            processed: false,
            released_at: None,
            deleted_at: None,
        };
        self.timed(async {
            sqlx::query(
                "INSERT INTO quarantine_entries
                 (id, user_id, platform_message_id, text, quarantined_at, processed)
                 VALUES (?, ?, ?, ?, ?, 0)",
            )
            .bind(entry.id.to_string())
            .bind(entry.user_id.0)
            .bind(entry.platform_message_id.0)
            .bind(&entry.text)
            .bind(entry.quarantined_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        Ok(entry)
    }

    /// A user's quarantine queue, oldest first. Soft-deleted entries are
    /// excluded.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn quarantine_queue(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> StoreResult<Vec<QuarantineEntry>> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT * FROM quarantine_entries
                 WHERE user_id = ? AND deleted_at IS NULL
                 ORDER BY quarantined_at, platform_message_id
                 LIMIT ?",
            )
            .bind(user_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_entry).collect()
        })
        .await
    }

    /// Fetch one entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown or soft-deleted ids.
    pub async fn get_quarantine_entry(
        &self,
        entry_id: QuarantineEntryId,
    ) -> StoreResult<QuarantineEntry> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT * FROM quarantine_entries WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(entry_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("quarantine entry {entry_id}")))?;
            row_to_entry(&row)
        })
        .await
    }

    /// Release an entry back toward intake: mark it processed, move its
    /// message id to the intake location, and durably append the synthetic
    /// intake row. Returns the entry the caller pushes onto the broker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the entry was already
    /// processed, [`StoreError::NotFound`] when it does not exist.
    pub async fn release_quarantine(
        &self,
        entry_id: QuarantineEntryId,
        now: DateTime<Utc>,
    ) -> StoreResult<IntakeEntry> {
        let entry = self.get_quarantine_entry(entry_id).await?;
        if entry.processed {
            return Err(StoreError::Conflict(format!(
                "quarantine entry {entry_id} already processed"
            )));
        }
        self.timed(async {
            let result = sqlx::query(
                "UPDATE quarantine_entries SET processed = 1, released_at = ?
                 WHERE id = ? AND processed = 0",
            )
            .bind(now)
            .bind(entry_id.to_string())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "quarantine entry {entry_id} already processed"
                )));
            }
            Ok(())
        })
        .await?;

        self.relocate_messages(
            entry.user_id,
            &[entry.platform_message_id],
            MessageLocation::Intake,
        )
        .await?;

        let intake = IntakeEntry {
            user_id: entry.user_id,
            platform_message_id: entry.platform_message_id,
            text: entry.text,
            platform_ts: entry.quarantined_at,
            received_at: now,
            is_recovered: false,
            released_from_quarantine: true,
        };
        self.timed(async {
            sqlx::query(
                "INSERT INTO intake_log
                 (user_id, platform_message_id, text, platform_ts, received_at,
                  is_recovered, released_from_quarantine)
                 VALUES (?, ?, ?, ?, ?, 0, 1)",
            )
            .bind(intake.user_id.0)
            .bind(intake.platform_message_id.0)
            .bind(&intake.text)
            .bind(intake.platform_ts)
            .bind(intake.received_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_insert(e, "released quarantine entry"))?;
            Ok(())
        })
        .await?;
        Ok(intake)
    }

    /// Move an already-ingested intake entry into quarantine: the activity
    /// tracker drains pending buffers here when the protocol activates
    /// mid-flight. The message id relocates from `intake` to `quarantine`
    /// and the intake row is marked processed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn quarantine_intake_entry(
        &self,
        entry: &IntakeEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<QuarantineEntry> {
        let quarantined = QuarantineEntry {
            id: QuarantineEntryId::new(),
            user_id: entry.user_id,
            platform_message_id: entry.platform_message_id,
            text: entry.text.clone(),
            quarantined_at: now,
            processed: false,
            released_at: None,
            deleted_at: None,
        };
        self.timed(async {
            sqlx::query(
                "INSERT INTO quarantine_entries
                 (id, user_id, platform_message_id, text, quarantined_at, processed)
                 VALUES (?, ?, ?, ?, ?, 0)",
            )
            .bind(quarantined.id.to_string())
            .bind(quarantined.user_id.0)
            .bind(quarantined.platform_message_id.0)
            .bind(&quarantined.text)
            .bind(quarantined.quarantined_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        self.relocate_messages(
            entry.user_id,
            &[entry.platform_message_id],
            MessageLocation::Quarantine,
        )
        .await?;
        self.mark_intake_processed(entry.user_id, &[entry.platform_message_id])
            .await?;
        Ok(quarantined)
    }

    /// Quarantine a whole set of ingested-but-unprocessed message ids,
    /// pulling their original texts from the intake log. Used when the
    /// protocol activates while a processing unit is mid-pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn quarantine_unprocessed_intake(
        &self,
        user_id: UserId,
        message_ids: &[PlatformMessageId],
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let rows = self
            .timed(async {
                let placeholders = vec!["?"; message_ids.len()].join(", ");
                let sql = format!(
                    "SELECT platform_message_id, text, platform_ts FROM intake_log
                     WHERE user_id = ? AND platform_message_id IN ({placeholders})"
                );
                let mut query = sqlx::query(&sql).bind(user_id.0);
                for id in message_ids {
                    query = query.bind(id.0);
                }
                Ok(query.fetch_all(&self.pool).await?)
            })
            .await?;

        let mut quarantined = 0;
        for row in &rows {
            let message_id = PlatformMessageId(row.try_get("platform_message_id")?);
            let text: String = row.try_get("text")?;
            self.timed(async {
                sqlx::query(
                    "INSERT INTO quarantine_entries
                     (id, user_id, platform_message_id, text, quarantined_at, processed)
                     VALUES (?, ?, ?, ?, ?, 0)",
                )
                .bind(QuarantineEntryId::new().to_string())
                .bind(user_id.0)
                .bind(message_id.0)
                .bind(&text)
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(())
            })
            .await?;
            quarantined += 1;
        }
        self.relocate_messages(user_id, message_ids, MessageLocation::Quarantine)
            .await?;
        self.mark_intake_processed(user_id, message_ids).await?;
        Ok(quarantined)
    }

    /// Soft-delete a user's quarantine entries (30-day retention handled by
    /// the janitor's hard purge).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn purge_quarantine(&self, user_id: UserId, now: DateTime<Utc>) -> StoreResult<u64> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE quarantine_entries SET deleted_at = ?
                 WHERE user_id = ? AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Hard-delete soft-deleted entries past their retention window.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn reap_purged_quarantine(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.timed(async {
            let result = sqlx::query(
                "DELETE FROM quarantine_entries
                 WHERE deleted_at IS NOT NULL AND deleted_at < ?",
            )
            .bind(older_than)
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

    #[tokio::test]
    async fn test_insert_and_queue_ordering() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_quarantine(UserId(1), PlatformMessageId(300), "first", now)
            .await
            .unwrap();
        store
            .insert_quarantine(UserId(1), PlatformMessageId(301), "second", now)
            .await
            .unwrap();
        let queue = store.quarantine_queue(UserId(1), 10).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].text, "first");
        assert!(!queue[0].processed);
    }

    #[tokio::test]
    async fn test_release_moves_to_intake() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        let entry = store
            .insert_quarantine(UserId(1), PlatformMessageId(300), "hello", now)
            .await
            .unwrap();

        let intake = store.release_quarantine(entry.id, now).await.unwrap();
        assert!(intake.released_from_quarantine);
        assert!(!intake.is_recovered);
        assert_eq!(intake.text, "hello");

        let location = store
            .message_location(UserId(1), PlatformMessageId(300))
            .await
            .unwrap();
        assert_eq!(location.as_deref(), Some("intake"));

        // Double release conflicts.
        let err = store.release_quarantine(entry.id, now).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_quarantine_blocks_duplicate_ingest() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_quarantine(UserId(1), PlatformMessageId(300), "hello", now)
            .await
            .unwrap();
        let err = store
            .insert_quarantine(UserId(1), PlatformMessageId(300), "again", now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_quarantine_from_intake_buffer() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        let entry = IntakeEntry {
            user_id: UserId(1),
            platform_message_id: PlatformMessageId(310),
            text: "buffered".to_string(),
            platform_ts: now,
            received_at: now,
            is_recovered: false,
            released_from_quarantine: false,
        };
        store.append_intake(&entry).await.unwrap();
        store.quarantine_intake_entry(&entry, now).await.unwrap();

        let location = store
            .message_location(UserId(1), PlatformMessageId(310))
            .await
            .unwrap();
        assert_eq!(location.as_deref(), Some("quarantine"));
        assert!(store.unprocessed_intake().await.unwrap().is_empty());
        let queue = store.quarantine_queue(UserId(1), 10).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].text, "buffered");
    }

    #[tokio::test]
    async fn test_purge_soft_deletes() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .insert_quarantine(UserId(1), PlatformMessageId(300), "x", now)
            .await
            .unwrap();
        let purged = store.purge_quarantine(UserId(1), now).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.quarantine_queue(UserId(1), 10).await.unwrap().is_empty());

        let reaped = store
            .reap_purged_quarantine(now + chrono::Duration::days(31))
            .await
            .unwrap();
        assert_eq!(reaped, 1);
    }
}
