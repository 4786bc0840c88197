//! User rows.

use chrono::{DateTime, Utc};
use sqlx::Row;

use maren_core::{User, UserId};

use crate::db::Store;
use crate::error::{StoreError, StoreResult};

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> StoreResult<User> {
    Ok(User {
        id: UserId(row.try_get("id")?),
        nickname: row.try_get("nickname")?,
        customer_status: row.try_get("customer_status")?,
        lifetime_value: row.try_get("lifetime_value")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    /// Insert-if-absent on first contact. Returns the stored row either way;
    /// an existing row is not modified (reviewers own nickname updates).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn upsert_user_on_contact(
        &self,
        user_id: UserId,
        nickname: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<User> {
        self.timed(async {
            sqlx::query(
                "INSERT INTO users (id, nickname, lifetime_value, created_at, updated_at)
                 VALUES (?, ?, 0.5, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(user_id.0)
            .bind(nickname)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            let row = sqlx::query("SELECT * FROM users WHERE id = ?")
                .bind(user_id.0)
                .fetch_one(&self.pool)
                .await?;
            row_to_user(&row)
        })
        .await
    }

    /// Fetch a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the user does not exist.
    pub async fn get_user(&self, user_id: UserId) -> StoreResult<User> {
        self.timed(async {
            let row = sqlx::query("SELECT * FROM users WHERE id = ?")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
            row_to_user(&row)
        })
        .await
    }

    /// Reviewer update of the customer label and value scalar.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the user does not exist.
    pub async fn set_customer_status(
        &self,
        user_id: UserId,
        status: Option<&str>,
        lifetime_value: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE users SET customer_status = ?, lifetime_value = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(status)
            .bind(lifetime_value.clamp(0.0, 1.0))
            .bind(now)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("user {user_id}")));
            }
            Ok(())
        })
        .await
    }

    /// Reviewer update of the display nickname.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the user does not exist.
    pub async fn set_nickname(
        &self,
        user_id: UserId,
        nickname: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.timed(async {
            let result =
                sqlx::query("UPDATE users SET nickname = ?, updated_at = ? WHERE id = ?")
                    .bind(nickname)
                    .bind(now)
                    .bind(user_id.0)
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("user {user_id}")));
            }
            Ok(())
        })
        .await
    }

    /// The whitelisted edit tags.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn edit_taxonomy(&self) -> StoreResult<Vec<String>> {
        self.timed(async {
            let rows = sqlx::query("SELECT tag FROM edit_taxonomy ORDER BY tag")
                .fetch_all(&self.pool)
                .await?;
            rows.iter()
                .map(|row| row.try_get::<String, _>("tag").map_err(StoreError::from))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_contact_is_insert_if_absent() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        let created = store
            .upsert_user_on_contact(UserId(1), Some("lena"), now)
            .await
            .unwrap();
        assert_eq!(created.nickname.as_deref(), Some("lena"));
        assert!((created.lifetime_value - 0.5).abs() < f64::EPSILON);

        // Second contact with a different nickname must not clobber.
        let again = store
            .upsert_user_on_contact(UserId(1), Some("other"), now)
            .await
            .unwrap();
        assert_eq!(again.nickname.as_deref(), Some("lena"));
    }

    #[tokio::test]
    async fn test_reviewer_updates() {
        let store = Store::connect_memory().await.unwrap();
        let now = Utc::now();
        store
            .upsert_user_on_contact(UserId(2), None, now)
            .await
            .unwrap();
        store
            .set_customer_status(UserId(2), Some("vip"), 0.9, now)
            .await
            .unwrap();
        store.set_nickname(UserId(2), "val", now).await.unwrap();
        let user = store.get_user(UserId(2)).await.unwrap();
        assert_eq!(user.customer_status.as_deref(), Some("vip"));
        assert_eq!(user.nickname.as_deref(), Some("val"));
        assert!((user.lifetime_value - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_user_is_not_found() {
        let store = Store::connect_memory().await.unwrap();
        let err = store.get_user(UserId(404)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_taxonomy_seeded() {
        let store = Store::connect_memory().await.unwrap();
        let tags = store.edit_taxonomy().await.unwrap();
        assert!(tags.contains(&"TONE".to_string()));
        assert!(tags.contains(&"SCHEDULE".to_string()));
    }
}
