//! Processing cursors and the message exclusivity index.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::Row;

use maren_core::{PlatformMessageId, UserId};

use crate::db::Store;
use crate::error::{StoreError, StoreResult};

/// Where an ingested platform message currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageLocation {
    Intake,
    Quarantine,
    Interaction,
}

impl MessageLocation {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Quarantine => "quarantine",
            Self::Interaction => "interaction",
        }
    }
}

impl Store {
    /// Last durably ingested platform message id for a user.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn cursor(&self, user_id: UserId) -> StoreResult<Option<PlatformMessageId>> {
        self.timed(async {
            let row =
                sqlx::query("SELECT last_message_id FROM processing_cursors WHERE user_id = ?")
                    .bind(user_id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row.map(|r| PlatformMessageId(r.get("last_message_id"))))
        })
        .await
    }

    /// Bulk cursor fetch, one round trip; used by recovery.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn cursors_for(
        &self,
        user_ids: &[UserId],
    ) -> StoreResult<HashMap<UserId, PlatformMessageId>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.timed(async {
            let placeholders = vec!["?"; user_ids.len()].join(", ");
            let sql = format!(
                "SELECT user_id, last_message_id FROM processing_cursors
                 WHERE user_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql);
            for id in user_ids {
                query = query.bind(id.0);
            }
            let rows = query.fetch_all(&self.pool).await?;
            Ok(rows
                .iter()
                .map(|r| {
                    (
                        UserId(r.get("user_id")),
                        PlatformMessageId(r.get("last_message_id")),
                    )
                })
                .collect())
        })
        .await
    }

    /// Advance a user's cursor to `message_id` if and only if it moves
    /// forward. Returns the stored cursor after the call. Losing the race
    /// (or presenting an older id) is not an error; the cursor simply
    /// stays put; it never regresses.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn advance_cursor(
        &self,
        user_id: UserId,
        message_id: PlatformMessageId,
        now: DateTime<Utc>,
    ) -> StoreResult<PlatformMessageId> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO processing_cursors (user_id, last_message_id, updated_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT (user_id) DO UPDATE
                 SET last_message_id = excluded.last_message_id,
                     updated_at = excluded.updated_at
                 WHERE processing_cursors.last_message_id < excluded.last_message_id",
            )
            .bind(user_id.0)
            .bind(message_id.0)
            .bind(now)
            .execute(&self.pool)
            .await?;
            let row =
                sqlx::query("SELECT last_message_id FROM processing_cursors WHERE user_id = ?")
                    .bind(user_id.0)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(PlatformMessageId(row.get("last_message_id")))
        })
        .await
    }

    /// Claim a platform message id for a location in the exclusivity index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the id was already claimed;
    /// the caller must drop the event as a duplicate ingest.
    pub(crate) async fn claim_message(
        &self,
        user_id: UserId,
        message_id: PlatformMessageId,
        location: MessageLocation,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO message_index (user_id, platform_message_id, location, recorded_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(user_id.0)
            .bind(message_id.0)
            .bind(location.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StoreError::from_insert(e, &format!("message ({user_id}, {message_id})"))
            })?;
            Ok(())
        })
        .await
    }

    /// Move already-claimed message ids to a new location.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub(crate) async fn relocate_messages(
        &self,
        user_id: UserId,
        message_ids: &[PlatformMessageId],
        location: MessageLocation,
    ) -> StoreResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.timed(async {
            let placeholders = vec!["?"; message_ids.len()].join(", ");
            let sql = format!(
                "UPDATE message_index SET location = ?
                 WHERE user_id = ? AND platform_message_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(location.as_str()).bind(user_id.0);
            for id in message_ids {
                query = query.bind(id.0);
            }
            query.execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    /// Where a platform message id currently lives, if anywhere.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn message_location(
        &self,
        user_id: UserId,
        message_id: PlatformMessageId,
    ) -> StoreResult<Option<String>> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT location FROM message_index
                 WHERE user_id = ? AND platform_message_id = ?",
            )
            .bind(user_id.0)
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(|r| r.get("location")))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        let user = UserId(1);

        assert_eq!(store.cursor(user).await.unwrap(), None);
        let cursor = store
            .advance_cursor(user, PlatformMessageId(100), now)
            .await
            .unwrap();
        assert_eq!(cursor, PlatformMessageId(100));

        // An older id leaves the cursor alone.
        let cursor = store
            .advance_cursor(user, PlatformMessageId(50), now)
            .await
            .unwrap();
        assert_eq!(cursor, PlatformMessageId(100));

        let cursor = store
            .advance_cursor(user, PlatformMessageId(102), now)
            .await
            .unwrap();
        assert_eq!(cursor, PlatformMessageId(102));
    }

    #[tokio::test]
    async fn test_bulk_cursor_fetch() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .advance_cursor(UserId(1), PlatformMessageId(10), now)
            .await
            .unwrap();
        store
            .advance_cursor(UserId(2), PlatformMessageId(20), now)
            .await
            .unwrap();
        let cursors = store
            .cursors_for(&[UserId(1), UserId(2), UserId(3)])
            .await
            .unwrap();
        assert_eq!(cursors.get(&UserId(1)), Some(&PlatformMessageId(10)));
        assert_eq!(cursors.get(&UserId(2)), Some(&PlatformMessageId(20)));
        assert_eq!(cursors.get(&UserId(3)), None);
    }

    #[tokio::test]
    async fn test_message_claim_is_exclusive() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .claim_message(UserId(1), PlatformMessageId(7), MessageLocation::Intake, now)
            .await
            .unwrap();
        let err = store
            .claim_message(
                UserId(1),
                PlatformMessageId(7),
                MessageLocation::Quarantine,
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        // Same id for a different user is fine.
        store
            .claim_message(UserId(2), PlatformMessageId(7), MessageLocation::Intake, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relocate_messages() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .claim_message(UserId(1), PlatformMessageId(7), MessageLocation::Intake, now)
            .await
            .unwrap();
        store
            .relocate_messages(
                UserId(1),
                &[PlatformMessageId(7)],
                MessageLocation::Interaction,
            )
            .await
            .unwrap();
        let location = store
            .message_location(UserId(1), PlatformMessageId(7))
            .await
            .unwrap();
        assert_eq!(location.as_deref(), Some("interaction"));
    }
}
