//! Review-queue service logic.

use maren_broker::keys;
use maren_core::{
    DispatchJob, InteractionId, ReviewerId, clock, review_priority,
};
use maren_pipeline::Resources;
use tracing::info;

use crate::dto::{ApproveRequest, PendingResponse, ReviewItemDto, SystemStatus};
use crate::error::{ApiError, ApiResult};

/// Hard-stop multiplier over the high watermark; beyond it, approvals get
/// a 503 instead of growing the backlog.
const HARD_STOP_FACTOR: usize = 2;

/// Prioritized review-queue operations.
pub struct ReviewService {
    resources: Resources,
}

impl ReviewService {
    /// Create the service over the shared resources.
    #[must_use]
    pub fn new(resources: Resources) -> Self {
        Self { resources }
    }

    fn weights(&self) -> (f64, f64, f64) {
        let review = &self.resources.config.review;
        (review.age_weight, review.value_weight, review.risk_weight)
    }

    /// List pending items in non-increasing live priority, FIFO within
    /// ties. The cursor is an opaque offset.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] on store failure or a bad cursor.
    pub async fn list_pending(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> ApiResult<PendingResponse> {
        let offset: usize = match cursor {
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::Validation("bad cursor".into()))?,
            None => 0,
        };
        let limit = limit.clamp(1, 200);

        let rows = self.resources.store.list_pending(i64::MAX).await?;
        let now = clock::now_utc();
        let weights = self.weights();

        let mut items: Vec<ReviewItemDto> = rows
            .into_iter()
            .map(|row| {
                #[allow(clippy::cast_precision_loss)]
                let age_minutes =
                    (now - row.interaction.created_at).num_seconds() as f64 / 60.0;
                ReviewItemDto {
                    interaction_id: row.interaction.id,
                    user_id: row.interaction.user_id,
                    priority: review_priority(
                        age_minutes,
                        row.user_value,
                        row.interaction.safety.risk_score,
                        weights,
                    ),
                    sequence: row.sequence,
                    enqueued_at: row.interaction.created_at,
                    risk_score: row.interaction.safety.risk_score,
                    user_value: row.user_value,
                    user_text: row.interaction.user_text,
                    bubbles: row.interaction.bubbles,
                    is_recovered: row.interaction.is_recovered,
                }
            })
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.sequence.cmp(&b.sequence))
        });

        let total = items.len();
        let page: Vec<ReviewItemDto> = items.into_iter().skip(offset).take(limit).collect();
        let next_cursor =
            (offset + page.len() < total).then(|| (offset + page.len()).to_string());

        Ok(PendingResponse {
            items: page,
            next_cursor,
            system_status: self.system_status(),
        })
    }

    /// Reviewer-facing banner flags.
    #[must_use]
    pub fn system_status(&self) -> SystemStatus {
        let queues = &self.resources.config.queues;
        SystemStatus {
            llm_degraded: self.resources.router.is_degraded(),
            approved_backlog: self.resources.broker.list_len(keys::APPROVED)
                > queues.approved_high_watermark,
            intake_backlog: self.resources.broker.list_len(keys::INTAKE)
                > queues.intake_high_watermark,
        }
    }

    /// Claim an item for a reviewer.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Conflict`] when another reviewer holds it.
    pub async fn claim(&self, id: InteractionId, reviewer: &ReviewerId) -> ApiResult<()> {
        self.resources
            .store
            .claim_interaction(id, reviewer, clock::now_utc())
            .await?;
        info!(interaction_id = %id, reviewer = %reviewer, "claimed");
        Ok(())
    }

    /// Approve an item: persist the final bubbles, drop it off the review
    /// queue, and enqueue the dispatch job.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Overloaded`] above the approved hard stop,
    /// [`ApiError::Validation`] for contract violations, and
    /// [`ApiError::Conflict`] on claim races.
    pub async fn approve(
        &self,
        id: InteractionId,
        reviewer: &ReviewerId,
        request: &ApproveRequest,
    ) -> ApiResult<maren_core::Interaction> {
        let hard_stop =
            self.resources.config.queues.approved_high_watermark * HARD_STOP_FACTOR;
        if self.resources.broker.list_len(keys::APPROVED) > hard_stop {
            return Err(ApiError::Overloaded("approved queue at hard stop".into()));
        }

        let whitelist = self.resources.store.edit_taxonomy().await?;
        let escaped_notes = request.validate(&whitelist)?;

        let interaction = self
            .resources
            .store
            .approve_interaction(
                id,
                reviewer,
                &request.final_bubbles,
                &request.edit_tags,
                request.quality_score,
                escaped_notes.as_deref(),
                clock::now_utc(),
            )
            .await?;

        self.resources.broker.zrem(keys::REVIEW_QUEUE, &id.to_string());
        self.resources.broker.push_back(
            keys::APPROVED,
            &DispatchJob {
                interaction_id: id,
                user_id: interaction.user_id,
                bubbles: request.final_bubbles.clone(),
            },
        )?;
        info!(interaction_id = %id, reviewer = %reviewer, "approved");
        Ok(interaction)
    }

    /// Reject an item. The user receives nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Conflict`] on claim races or terminal states.
    pub async fn reject(
        &self,
        id: InteractionId,
        reviewer: &ReviewerId,
        reason: &str,
    ) -> ApiResult<maren_core::Interaction> {
        let interaction = self
            .resources
            .store
            .reject_interaction(id, reviewer, reason, clock::now_utc())
            .await?;
        self.resources.broker.zrem(keys::REVIEW_QUEUE, &id.to_string());
        info!(interaction_id = %id, reviewer = %reviewer, "rejected");
        Ok(interaction)
    }
}

impl std::fmt::Debug for ReviewService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewService").finish_non_exhaustive()
    }
}
