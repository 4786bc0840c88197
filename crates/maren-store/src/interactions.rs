//! Interaction rows and review-state transitions.
//!
//! All review transitions are conditional updates: the `WHERE` clause
//! encodes the legal source states, and zero affected rows means the caller
//! lost an optimistic-concurrency race.

use chrono::{DateTime, Utc};
use sqlx::Row;

use maren_core::{
    DispatchState, Interaction, InteractionId, PlatformMessageId, ReviewStatus, ReviewerId,
    SafetyAnnotation, StageUsage, UserId,
};

use crate::cursors::MessageLocation;
use crate::db::Store;
use crate::error::{StoreError, StoreResult};

/// A pending interaction joined with the inputs the priority formula needs.
#[derive(Debug, Clone)]
pub struct PendingRow {
    /// The interaction.
    pub interaction: Interaction,
    /// Monotonic insertion sequence (FIFO tiebreak).
    pub sequence: i64,
    /// The sender's value scalar.
    pub user_value: f64,
}

fn json_opt<T: serde::de::DeserializeOwned>(raw: Option<String>) -> StoreResult<Option<T>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StoreError::from)
}

#[allow(clippy::too_many_lines)]
fn row_to_interaction(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Interaction> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("review_status")?;
    let dispatch: Option<String> = row.try_get("dispatch_state")?;
    let source_ids: String = row.try_get("source_message_ids")?;
    let bubbles: String = row.try_get("bubbles")?;
    let flags: String = row.try_get("safety_flags")?;
    let edit_tags: String = row.try_get("edit_tags")?;
    let generation_usage: String = row.try_get("generation_usage")?;
    let quality: Option<i64> = row.try_get("quality_score")?;

    Ok(Interaction {
        id: id
            .parse()
            .map_err(|_| StoreError::NotFound(format!("bad interaction id {id}")))?,
        user_id: UserId(row.try_get("user_id")?),
        platform_message_id: PlatformMessageId(row.try_get("platform_message_id")?),
        source_message_ids: serde_json::from_str(&source_ids)?,
        platform_ts: row.try_get("platform_ts")?,
        received_at: row.try_get("received_at")?,
        user_text: row.try_get("user_text")?,
        generator_text: row.try_get("generator_text")?,
        draft_text: row.try_get("draft_text")?,
        bubbles: serde_json::from_str(&bubbles)?,
        safety: SafetyAnnotation {
            risk_score: row.try_get("safety_risk")?,
            flags: serde_json::from_str(&flags)?,
        },
        review_status: status
            .parse()
            .map_err(StoreError::NotFound)?,
        reviewer_id: row
            .try_get::<Option<String>, _>("reviewer_id")?
            .map(ReviewerId),
        claimed_at: row.try_get("claimed_at")?,
        reviewed_at: row.try_get("reviewed_at")?,
        review_latency_secs: row.try_get("review_latency_secs")?,
        final_bubbles: json_opt(row.try_get("final_bubbles")?)?,
        edit_tags: serde_json::from_str(&edit_tags)?,
        quality_score: quality.and_then(|q| u8::try_from(q).ok()),
        reviewer_notes: row.try_get("reviewer_notes")?,
        generation_usage: serde_json::from_str(&generation_usage)?,
        coherence_usage: json_opt::<StageUsage>(row.try_get("coherence_usage")?)?,
        refinement_usage: json_opt::<StageUsage>(row.try_get("refinement_usage")?)?,
        is_recovered: row.try_get("is_recovered")?,
        identity_loop_suspected: row.try_get("identity_loop_suspected")?,
        dispatch_state: dispatch
            .map(|s| s.parse().map_err(StoreError::NotFound))
            .transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Persist a freshly produced interaction: insert the row, move its
    /// platform ids to the `interaction` location, and mark the intake rows
    /// processed. Returns the insertion sequence used for FIFO tiebreaks.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn insert_interaction(&self, interaction: &Interaction) -> StoreResult<i64> {
        let source_ids = serde_json::to_string(&interaction.source_message_ids)?;
        let bubbles = serde_json::to_string(&interaction.bubbles)?;
        let flags = serde_json::to_string(&interaction.safety.flags)?;
        let edit_tags = serde_json::to_string(&interaction.edit_tags)?;
        let generation_usage = serde_json::to_string(&interaction.generation_usage)?;
        let coherence_usage = interaction
            .coherence_usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let refinement_usage = interaction
            .refinement_usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let sequence = self
            .timed(async {
                let result = sqlx::query(
                    "INSERT INTO interactions
                     (id, user_id, platform_message_id, source_message_ids, platform_ts,
                      received_at, user_text, generator_text, draft_text, bubbles,
                      safety_risk, safety_flags, review_status, generation_usage,
                      coherence_usage, refinement_usage, is_recovered,
                      identity_loop_suspected, edit_tags, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(interaction.id.to_string())
                .bind(interaction.user_id.0)
                .bind(interaction.platform_message_id.0)
                .bind(&source_ids)
                .bind(interaction.platform_ts)
                .bind(interaction.received_at)
                .bind(&interaction.user_text)
                .bind(&interaction.generator_text)
                .bind(&interaction.draft_text)
                .bind(&bubbles)
                .bind(interaction.safety.risk_score)
                .bind(&flags)
                .bind(interaction.review_status.as_str())
                .bind(&generation_usage)
                .bind(&coherence_usage)
                .bind(&refinement_usage)
                .bind(interaction.is_recovered)
                .bind(interaction.identity_loop_suspected)
                .bind(&edit_tags)
                .bind(interaction.created_at)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StoreError::from_insert(e, &format!("interaction {}", interaction.id))
                })?;
                Ok(result.last_insert_rowid())
            })
            .await?;

        self.relocate_messages(
            interaction.user_id,
            &interaction.source_message_ids,
            MessageLocation::Interaction,
        )
        .await?;
        self.mark_intake_processed(interaction.user_id, &interaction.source_message_ids)
            .await?;
        Ok(sequence)
    }

    /// Whether any of the given platform ids already belongs to an
    /// interaction; the supervisor's idempotence check.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn interaction_overlaps(
        &self,
        user_id: UserId,
        message_ids: &[PlatformMessageId],
    ) -> StoreResult<bool> {
        if message_ids.is_empty() {
            return Ok(false);
        }
        self.timed(async {
            let placeholders = vec!["?"; message_ids.len()].join(", ");
            let sql = format!(
                "SELECT COUNT(*) AS n FROM message_index
                 WHERE user_id = ? AND location = 'interaction'
                   AND platform_message_id IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(user_id.0);
            for id in message_ids {
                query = query.bind(id.0);
            }
            let row = query.fetch_one(&self.pool).await?;
            let n: i64 = row.try_get("n")?;
            Ok(n > 0)
        })
        .await
    }

    /// Fetch one interaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn get_interaction(&self, id: InteractionId) -> StoreResult<Interaction> {
        self.timed(async {
            let row = sqlx::query("SELECT * FROM interactions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("interaction {id}")))?;
            row_to_interaction(&row)
        })
        .await
    }

    /// Insertion sequence of an interaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn interaction_sequence(&self, id: InteractionId) -> StoreResult<i64> {
        self.timed(async {
            let row = sqlx::query("SELECT rowid FROM interactions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("interaction {id}")))?;
            Ok(row.try_get("rowid")?)
        })
        .await
    }

    /// Pending interactions joined with user value scalars, oldest first.
    /// Priority ordering happens in the review service, which rescoring by
    /// age requires.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn list_pending(&self, limit: i64) -> StoreResult<Vec<PendingRow>> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT i.*, i.rowid AS seq, COALESCE(u.lifetime_value, 0.5) AS user_value
                 FROM interactions i LEFT JOIN users u ON u.id = i.user_id
                 WHERE i.review_status = 'pending'
                 ORDER BY i.rowid
                 LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(|row| {
                    Ok(PendingRow {
                        interaction: row_to_interaction(row)?,
                        sequence: row.try_get("seq")?,
                        user_value: row.try_get("user_value")?,
                    })
                })
                .collect()
        })
        .await
    }

    /// Count of pending interactions.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn pending_count(&self) -> StoreResult<u64> {
        self.timed(async {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n FROM interactions WHERE review_status = 'pending'",
            )
            .fetch_one(&self.pool)
            .await?;
            let n: i64 = row.try_get("n")?;
            #[allow(clippy::cast_sign_loss)]
            Ok(n as u64)
        })
        .await
    }

    /// `pending → claimed`. Idempotent for the same reviewer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when another reviewer holds the
    /// claim or the interaction is terminal.
    pub async fn claim_interaction(
        &self,
        id: InteractionId,
        reviewer: &ReviewerId,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE interactions
                 SET review_status = 'claimed', reviewer_id = ?, claimed_at = ?
                 WHERE id = ? AND review_status = 'pending'",
            )
            .bind(reviewer.as_str())
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(());
            }
            // Lost the race; idempotent success only for the same reviewer.
            let row = sqlx::query(
                "SELECT review_status, reviewer_id FROM interactions WHERE id = ?",
            )
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("interaction {id}")))?;
            let status: String = row.try_get("review_status")?;
            let holder: Option<String> = row.try_get("reviewer_id")?;
            if status == ReviewStatus::Claimed.as_str() && holder.as_deref() == Some(reviewer.as_str())
            {
                Ok(())
            } else {
                Err(StoreError::Conflict(format!(
                    "interaction {id} is {status}"
                )))
            }
        })
        .await
    }

    /// `pending|claimed → approved` with the reviewer's final bubbles.
    /// A claim held by a different reviewer blocks the approval.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on an illegal transition.
    #[allow(clippy::too_many_arguments)]
    pub async fn approve_interaction(
        &self,
        id: InteractionId,
        reviewer: &ReviewerId,
        final_bubbles: &[String],
        edit_tags: &[String],
        quality_score: u8,
        reviewer_notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Interaction> {
        maren_core::error::validate_bubbles(final_bubbles)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let bubbles_json = serde_json::to_string(final_bubbles)?;
        let tags_json = serde_json::to_string(edit_tags)?;
        self.timed(async {
            let result = sqlx::query(
                "UPDATE interactions
                 SET review_status = 'approved', reviewer_id = ?, reviewed_at = ?,
                     final_bubbles = ?, edit_tags = ?, quality_score = ?,
                     reviewer_notes = COALESCE(?, reviewer_notes),
                     review_latency_secs =
                         (julianday(?) - julianday(created_at)) * 86400.0
                 WHERE id = ?
                   AND (review_status = 'pending'
                        OR (review_status = 'claimed' AND reviewer_id = ?))",
            )
            .bind(reviewer.as_str())
            .bind(now)
            .bind(&bubbles_json)
            .bind(&tags_json)
            .bind(i64::from(quality_score))
            .bind(reviewer_notes)
            .bind(now)
            .bind(id.to_string())
            .bind(reviewer.as_str())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "interaction {id} cannot be approved"
                )));
            }
            Ok(())
        })
        .await?;
        self.get_interaction(id).await
    }

    /// `pending|claimed → rejected`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on an illegal transition.
    pub async fn reject_interaction(
        &self,
        id: InteractionId,
        reviewer: &ReviewerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Interaction> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE interactions
                 SET review_status = 'rejected', reviewer_id = ?, reviewed_at = ?,
                     reviewer_notes = ?,
                     review_latency_secs =
                         (julianday(?) - julianday(created_at)) * 86400.0
                 WHERE id = ?
                   AND (review_status = 'pending'
                        OR (review_status = 'claimed' AND reviewer_id = ?))",
            )
            .bind(reviewer.as_str())
            .bind(now)
            .bind(reason)
            .bind(now)
            .bind(id.to_string())
            .bind(reviewer.as_str())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "interaction {id} cannot be rejected"
                )));
            }
            Ok(())
        })
        .await?;
        self.get_interaction(id).await
    }

    /// `pending|claimed → cancelled` (quarantine activated mid-review).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the interaction is terminal.
    pub async fn cancel_interaction(
        &self,
        id: InteractionId,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.timed(async {
            let result = sqlx::query(
                "UPDATE interactions
                 SET review_status = 'cancelled', reviewed_at = ?
                 WHERE id = ? AND review_status IN ('pending', 'claimed')",
            )
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "interaction {id} cannot be cancelled"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Cancel every pending/claimed interaction of a quarantined user.
    /// Returns the cancelled ids so the caller can drop their review items.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn cancel_open_interactions_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<InteractionId>> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT id FROM interactions
                 WHERE user_id = ? AND review_status IN ('pending', 'claimed')",
            )
            .bind(user_id.0)
            .fetch_all(&self.pool)
            .await?;
            let ids: Vec<InteractionId> = rows
                .iter()
                .filter_map(|row| row.get::<String, _>("id").parse().ok())
                .collect();
            sqlx::query(
                "UPDATE interactions SET review_status = 'cancelled', reviewed_at = ?
                 WHERE user_id = ? AND review_status IN ('pending', 'claimed')",
            )
            .bind(now)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
            Ok(ids)
        })
        .await
    }

    /// Record the dispatch outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn set_dispatch_state(
        &self,
        id: InteractionId,
        state: DispatchState,
    ) -> StoreResult<()> {
        self.timed(async {
            let result = sqlx::query("UPDATE interactions SET dispatch_state = ? WHERE id = ?")
                .bind(state.as_str())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("interaction {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Post-approval audit note edit.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    pub async fn update_reviewer_notes(
        &self,
        id: InteractionId,
        notes: &str,
    ) -> StoreResult<()> {
        self.timed(async {
            let result = sqlx::query("UPDATE interactions SET reviewer_notes = ? WHERE id = ?")
                .bind(notes)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("interaction {id}")));
            }
            Ok(())
        })
        .await
    }

    /// Approved interactions the dispatcher has not finished; broker
    /// reseed at startup.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn approved_undispatched(&self) -> StoreResult<Vec<Interaction>> {
        self.timed(async {
            let rows = sqlx::query(
                "SELECT * FROM interactions
                 WHERE review_status = 'approved' AND dispatch_state IS NULL
                 ORDER BY reviewed_at",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_interaction).collect()
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use maren_core::IntakeEntry;

    pub(crate) fn sample_interaction(user: i64, message_id: i64) -> Interaction {
        let now = Utc::now();
        Interaction {
            id: InteractionId::new(),
            user_id: UserId(user),
            platform_message_id: PlatformMessageId(message_id),
            source_message_ids: vec![PlatformMessageId(message_id)],
            platform_ts: now,
            received_at: now,
            user_text: "hey what are you up to?".to_string(),
            generator_text: "just studying".to_string(),
            draft_text: "just studying".to_string(),
            bubbles: vec!["just studying 📚".to_string(), "you?".to_string()],
            safety: SafetyAnnotation::default(),
            review_status: ReviewStatus::Pending,
            reviewer_id: None,
            claimed_at: None,
            reviewed_at: None,
            review_latency_secs: None,
            final_bubbles: None,
            edit_tags: Vec::new(),
            quality_score: None,
            reviewer_notes: None,
            generation_usage: StageUsage {
                model: "test-model".to_string(),
                tokens_in: 100,
                tokens_out: 50,
                cached_tokens: 0,
                cost_usd: 0.001,
            },
            coherence_usage: None,
            refinement_usage: None,
            is_recovered: false,
            identity_loop_suspected: false,
            dispatch_state: None,
            created_at: now,
        }
    }

    async fn seed(store: &Store, user: i64, message_id: i64) -> Interaction {
        let entry = IntakeEntry {
            user_id: UserId(user),
            platform_message_id: PlatformMessageId(message_id),
            text: "hey".to_string(),
            platform_ts: Utc::now(),
            received_at: Utc::now(),
            is_recovered: false,
            released_from_quarantine: false,
        };
        store.append_intake(&entry).await.unwrap();
        let interaction = sample_interaction(user, message_id);
        store.insert_interaction(&interaction).await.unwrap();
        interaction
    }

    #[tokio::test]
    async fn test_insert_roundtrip_and_relocation() {
        let store = Store::connect_memory().await.unwrap();
        let interaction = seed(&store, 1, 100).await;

        let fetched = store.get_interaction(interaction.id).await.unwrap();
        assert_eq!(fetched.user_text, interaction.user_text);
        assert_eq!(fetched.bubbles.len(), 2);
        assert_eq!(fetched.review_status, ReviewStatus::Pending);
        assert_eq!(fetched.generation_usage.tokens_in, 100);

        let location = store
            .message_location(UserId(1), PlatformMessageId(100))
            .await
            .unwrap();
        assert_eq!(location.as_deref(), Some("interaction"));
        assert_eq!(store.unprocessed_intake().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_idempotence_overlap_check() {
        let store = Store::connect_memory().await.unwrap();
        seed(&store, 1, 100).await;
        assert!(
            store
                .interaction_overlaps(UserId(1), &[PlatformMessageId(100), PlatformMessageId(101)])
                .await
                .unwrap()
        );
        assert!(
            !store
                .interaction_overlaps(UserId(1), &[PlatformMessageId(101)])
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_claim_race_exactly_one_winner() {
        let store = Store::connect_memory().await.unwrap();
        let interaction = seed(&store, 1, 100).await;
        let now = Utc::now();

        let alice = ReviewerId::new("alice");
        let bob = ReviewerId::new("bob");
        store
            .claim_interaction(interaction.id, &alice, now)
            .await
            .unwrap();
        // Same reviewer: idempotent.
        store
            .claim_interaction(interaction.id, &alice, now)
            .await
            .unwrap();
        // Other reviewer: conflict.
        let err = store
            .claim_interaction(interaction.id, &bob, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let fetched = store.get_interaction(interaction.id).await.unwrap();
        assert_eq!(fetched.reviewer_id, Some(alice));
    }

    #[tokio::test]
    async fn test_approve_records_latency_and_bubbles() {
        let store = Store::connect_memory().await.unwrap();
        let interaction = seed(&store, 1, 100).await;
        let reviewer = ReviewerId::new("alice");

        let approved = store
            .approve_interaction(
                interaction.id,
                &reviewer,
                &["just studying 📚".to_string(), "you?".to_string()],
                &["TONE".to_string()],
                4,
                Some("nice"),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(approved.review_status, ReviewStatus::Approved);
        assert_eq!(approved.final_bubbles.as_ref().unwrap().len(), 2);
        assert_eq!(approved.quality_score, Some(4));
        assert!(approved.review_latency_secs.unwrap() >= 0.0);

        // Terminal: further transitions conflict.
        let err = store
            .reject_interaction(interaction.id, &reviewer, "no", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_claimed_by_other_blocks_approval() {
        let store = Store::connect_memory().await.unwrap();
        let interaction = seed(&store, 1, 100).await;
        store
            .claim_interaction(interaction.id, &ReviewerId::new("alice"), Utc::now())
            .await
            .unwrap();
        let err = store
            .approve_interaction(
                interaction.id,
                &ReviewerId::new("bob"),
                &["hi".to_string()],
                &[],
                3,
                None,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_open_for_user() {
        let store = Store::connect_memory().await.unwrap();
        let a = seed(&store, 1, 100).await;
        let b = seed(&store, 1, 101).await;
        let other = seed(&store, 2, 100).await;

        let cancelled = store
            .cancel_open_interactions_for_user(UserId(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.contains(&a.id) && cancelled.contains(&b.id));
        assert_eq!(
            store.get_interaction(other.id).await.unwrap().review_status,
            ReviewStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_pending_listing_and_sequence() {
        let store = Store::connect_memory().await.unwrap();
        let first = seed(&store, 1, 100).await;
        let second = seed(&store, 2, 100).await;

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].interaction.id, first.id);
        assert!(pending[0].sequence < pending[1].sequence);
        // No user row value set: defaults to 0.5 via the join.
        assert!((pending[0].user_value - 0.5).abs() < f64::EPSILON);
        let _ = second;
        assert_eq!(store.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_state_and_reseed_query() {
        let store = Store::connect_memory().await.unwrap();
        let interaction = seed(&store, 1, 100).await;
        store
            .approve_interaction(
                interaction.id,
                &ReviewerId::new("alice"),
                &["ok".to_string()],
                &[],
                5,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        let undispatched = store.approved_undispatched().await.unwrap();
        assert_eq!(undispatched.len(), 1);

        store
            .set_dispatch_state(interaction.id, DispatchState::Sent)
            .await
            .unwrap();
        assert!(store.approved_undispatched().await.unwrap().is_empty());
    }
}
