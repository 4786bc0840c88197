//! The durable intake log.
//!
//! The broker's `intake` list is the in-process FIFO; this table is its
//! durable twin. Ingress appends here first (claiming the message id in the
//! exclusivity index and advancing the cursor in the same breath), then
//! pushes to the broker. At startup the daemon re-enqueues every
//! unprocessed row, so a crash between append and processing loses nothing.

use sqlx::Row;

use maren_core::{IntakeEntry, PlatformMessageId, UserId};

use crate::cursors::MessageLocation;
use crate::db::Store;
use crate::error::{StoreError, StoreResult};

/// One intake row plus its log id.
#[derive(Debug, Clone)]
pub struct IntakeRow {
    /// Log row id (insertion order).
    pub id: i64,
    /// The entry payload.
    pub entry: IntakeEntry,
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> StoreResult<IntakeRow> {
    Ok(IntakeRow {
        id: row.try_get("id")?,
        entry: IntakeEntry {
            user_id: UserId(row.try_get("user_id")?),
            platform_message_id: PlatformMessageId(row.try_get("platform_message_id")?),
            text: row.try_get("text")?,
            platform_ts: row.try_get("platform_ts")?,
            received_at: row.try_get("received_at")?,
            is_recovered: row.try_get("is_recovered")?,
            released_from_quarantine: row.try_get("released_from_quarantine")?,
        },
    })
}

impl Store {
    /// Durably append a message to the intake log: claim the id in the
    /// exclusivity index, insert the row, and advance the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the (user, message) pair was
    /// already ingested anywhere; the caller drops the event.
    pub async fn append_intake(&self, entry: &IntakeEntry) -> StoreResult<()> {
        self.claim_message(
            entry.user_id,
            entry.platform_message_id,
            MessageLocation::Intake,
            entry.received_at,
        )
        .await?;
        self.timed(async {
            sqlx::query(
                "INSERT INTO intake_log
                 (user_id, platform_message_id, text, platform_ts, received_at,
                  is_recovered, released_from_quarantine)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.user_id.0)
            .bind(entry.platform_message_id.0)
            .bind(&entry.text)
            .bind(entry.platform_ts)
            .bind(entry.received_at)
            .bind(entry.is_recovered)
            .bind(entry.released_from_quarantine)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StoreError::from_insert(
                    e,
                    &format!(
                        "intake ({}, {})",
                        entry.user_id, entry.platform_message_id
                    ),
                )
            })?;
            Ok(())
        })
        .await?;
        self.advance_cursor(
            entry.user_id,
            entry.platform_message_id,
            entry.received_at,
        )
        .await?;
        Ok(())
    }

    /// Mark contributing platform ids processed once their interaction
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn mark_intake_processed(
        &self,
        user_id: UserId,
        message_ids: &[PlatformMessageId],
    ) -> StoreResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.timed(async {
            let placeholders = vec!["?"; message_ids.len()].join(", ");
            let sql = format!(
                "UPDATE intake_log SET processed = 1
                 WHERE user_id = ? AND platform_message_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(user_id.0);
            for id in message_ids {
                query = query.bind(id.0);
            }
            query.execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    /// Every unprocessed intake row in insertion order, for startup reseed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn unprocessed_intake(&self) -> StoreResult<Vec<IntakeRow>> {
        self.timed(async {
            let rows =
                sqlx::query("SELECT * FROM intake_log WHERE processed = 0 ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?;
            rows.iter().map(row_to_entry).collect()
        })
        .await
    }

    /// Intake depth that survived a restart (unprocessed rows).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn unprocessed_intake_len(&self) -> StoreResult<u64> {
        self.timed(async {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM intake_log WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;
            let n: i64 = row.try_get("n")?;
            #[allow(clippy::cast_sign_loss)]
            Ok(n as u64)
        })
        .await
    }
}
