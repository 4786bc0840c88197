//! Per-user protocol (quarantine) state.

use chrono::{DateTime, Utc};
use sqlx::Row;

use maren_core::{ProtocolState, ReviewerId, UserId};

use crate::db::Store;
use crate::error::StoreResult;

impl Store {
    /// Current protocol state; absent rows read as inactive.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn protocol_state(&self, user_id: UserId) -> StoreResult<ProtocolState> {
        self.timed(async {
            let row = sqlx::query("SELECT * FROM protocol_states WHERE user_id = ?")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => Ok(ProtocolState {
                    user_id,
                    active: row.try_get("active")?,
                    last_changed_at: row.try_get("last_changed_at")?,
                    actor: row
                        .try_get::<Option<String>, _>("actor")?
                        .map(ReviewerId),
                }),
                None => Ok(ProtocolState {
                    user_id,
                    active: false,
                    last_changed_at: DateTime::<Utc>::MIN_UTC,
                    actor: None,
                }),
            }
        })
        .await
    }

    /// Flip the protocol state, recording who did it.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::StoreError`] on database failure.
    pub async fn set_protocol_state(
        &self,
        user_id: UserId,
        active: bool,
        actor: &ReviewerId,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO protocol_states (user_id, active, last_changed_at, actor)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (user_id) DO UPDATE
                 SET active = excluded.active,
                     last_changed_at = excluded.last_changed_at,
                     actor = excluded.actor",
            )
            .bind(user_id.0)
            .bind(active)
            .bind(now)
            .bind(actor.as_str())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_absent_state_is_inactive() {
        let store = Store::connect_memory().await.unwrap();
        let state = store.protocol_state(UserId(1)).await.unwrap();
        assert!(!state.active);
        assert!(state.actor.is_none());
    }

    #[tokio::test]
    async fn test_flip_and_read_back() {
        let store = Store::connect_memory().await.unwrap();
        let reviewer = ReviewerId::new("alice");
        store
            .set_protocol_state(UserId(1), true, &reviewer, Utc::now())
            .await
            .unwrap();
        let state = store.protocol_state(UserId(1)).await.unwrap();
        assert!(state.active);
        assert_eq!(state.actor, Some(reviewer.clone()));

        store
            .set_protocol_state(UserId(1), false, &reviewer, Utc::now())
            .await
            .unwrap();
        assert!(!store.protocol_state(UserId(1)).await.unwrap().active);
    }
}
