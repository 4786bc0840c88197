//! The supervisor: one processing unit in, one pending review item out.
//!
//! Pipeline steps, strictly ordered: context assembly → generation →
//! coherence check → bubble formatting → safety annotation → persist &
//! enqueue. The protocol gate is re-checked between steps so a quarantine
//! flip mid-pipeline parks the unit instead of producing a review item.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use maren_broker::keys;
use maren_core::{
    CoherenceRecord, CoherenceStatus, Interaction, InteractionId, ProcessingUnit, ReviewStatus,
    StageUsage, UserId, clock, review_priority,
};
use maren_llm::LlmError;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::PipelineResult;
use crate::prompts;
use crate::protocol::{ProtocolManager, RouteDecision};
use crate::resources::Resources;

/// Commitments further out than this do not participate in coherence checks.
const COMMITMENT_HORIZON_DAYS: i64 = 7;

/// Bubble separator token the refiner is instructed to emit.
const BUBBLE_TOKEN: &str = "[BUBBLE]";

/// What processing a unit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// A pending interaction was created and enqueued for review.
    Created(InteractionId),
    /// The unit's platform ids already belong to an interaction; the intake
    /// log was reconciled and nothing else happened.
    SkippedDuplicate,
    /// Quota is exhausted; the unit was requeued for a later retry.
    Requeued,
    /// The user was quarantined mid-flight; the unit was parked.
    Quarantined,
}

/// Parsed coherence verdict, shaped like the JSON the refiner is asked for.
#[derive(Debug, Deserialize)]
struct VerdictJson {
    status: String,
    #[serde(default)]
    original_span: Option<String>,
    #[serde(default)]
    replacement_span: Option<String>,
    #[serde(default)]
    new_commitments: Option<Vec<NewCommitmentJson>>,
}

#[derive(Debug, Deserialize)]
struct NewCommitmentJson {
    text: String,
    target_ts: String,
}

/// The per-message generation pipeline.
pub struct Supervisor {
    resources: Resources,
    protocol: Arc<ProtocolManager>,
}

impl Supervisor {
    /// Create a supervisor over the shared resources.
    #[must_use]
    pub fn new(resources: Resources, protocol: Arc<ProtocolManager>) -> Self {
        Self {
            resources,
            protocol,
        }
    }

    /// Run the full pipeline for one unit. The caller must hold the user's
    /// supervisor lock.
    ///
    /// # Errors
    ///
    /// Any error leaves the intake entries unprocessed; the worker retries
    /// the unit up to the configured budget, then dead-letters it.
    #[allow(clippy::too_many_lines)]
    pub async fn process_unit(&self, unit: ProcessingUnit) -> PipelineResult<SupervisorOutcome> {
        let user_id = unit.user_id;

        // Idempotence: a unit whose ids already produced an interaction is
        // reconciled, never re-processed.
        if self
            .resources
            .store
            .interaction_overlaps(user_id, &unit.message_ids)
            .await?
        {
            self.resources
                .store
                .mark_intake_processed(user_id, &unit.message_ids)
                .await?;
            debug!(%user_id, "unit overlaps existing interaction, reconciled");
            return Ok(SupervisorOutcome::SkippedDuplicate);
        }

        if self.quarantined(user_id).await? {
            return self.park_unit(&unit).await;
        }

        // Step 1: context assembly.
        let now = clock::now_utc();
        let persona = &self.resources.config.persona;
        let summary = self.resources.memory.summary(user_id).await?;
        let history = self.resources.memory.recent_default(user_id).await?;
        self.resources
            .memory
            .append(user_id, maren_memory::MemoryRole::User, &unit.combined_text, now)
            .await?;
        let recovered_age = unit
            .is_recovered
            .then(|| clock::now_utc() - unit.platform_ts);

        // Step 2: generation (restarted at most once on identity conflict).
        let mut variant = self.variant_index(user_id);
        let mut identity_loop_suspected = false;
        let mut generation;
        let mut coherence_usage: Option<StageUsage> = None;
        let mut record: Option<CoherenceRecord> = None;
        let interaction_id = InteractionId::new();
        let mut draft;

        let mut restarts = 0;
        loop {
            let (system, user_prompt) = prompts::generator_prompt(
                persona,
                variant,
                now,
                &summary,
                &history,
                &unit.combined_text,
                recovered_age,
            );
            generation = match self.resources.router.generate(&system, &user_prompt).await {
                Ok(generation) => generation,
                Err(LlmError::QuotaExhausted { role }) => {
                    warn!(%user_id, role, "quota exhausted, requeueing unit");
                    let mut requeued = unit.clone();
                    requeued.attempts = requeued.attempts.saturating_add(1);
                    self.resources.broker.push_back(keys::UNITS, &requeued)?;
                    return Ok(SupervisorOutcome::Requeued);
                },
                Err(LlmError::MalformedResponse(raw)) => {
                    // Reviewer will edit; carry the raw string forward.
                    warn!(%user_id, "generator output malformed after fallback");
                    maren_llm::Generation {
                        text: raw,
                        usage: StageUsage::default(),
                    }
                },
                Err(err) => return Err(err.into()),
            };
            draft = generation.text.clone();

            if self.quarantined(user_id).await? {
                return self.park_unit(&unit).await;
            }

            // Step 3: coherence check.
            let (verdict, usage) = self.coherence_check(user_id, &draft, now).await?;
            coherence_usage = usage.or(coherence_usage);
            match verdict {
                Some(verdict) => {
                    let status = verdict_status(&verdict.status);
                    match status {
                        CoherenceStatus::AvailabilityConflict => {
                            let (corrected, original, replacement) =
                                apply_correction(&draft, &verdict);
                            draft = corrected;
                            record = Some(CoherenceRecord {
                                interaction_id,
                                status,
                                original_span: original,
                                replacement_span: replacement,
                                new_commitments: 0,
                                created_at: now,
                            });
                            self.persist_new_commitments(user_id, &verdict, &mut record)
                                .await?;
                            break;
                        },
                        CoherenceStatus::IdentityConflict if restarts == 0 => {
                            restarts += 1;
                            variant = self.rotate_variant(user_id);
                            info!(%user_id, variant, "identity conflict, rotating prompt variant");
                            continue;
                        },
                        CoherenceStatus::IdentityConflict => {
                            identity_loop_suspected = true;
                            record = Some(CoherenceRecord {
                                interaction_id,
                                status,
                                original_span: None,
                                replacement_span: None,
                                new_commitments: 0,
                                created_at: now,
                            });
                            self.persist_new_commitments(user_id, &verdict, &mut record)
                                .await?;
                            break;
                        },
                        CoherenceStatus::Ok => {
                            record = Some(CoherenceRecord {
                                interaction_id,
                                status,
                                original_span: None,
                                replacement_span: None,
                                new_commitments: 0,
                                created_at: now,
                            });
                            self.persist_new_commitments(user_id, &verdict, &mut record)
                                .await?;
                            break;
                        },
                    }
                },
                None => {
                    // Unparseable even after repair: treated as ok.
                    warn!(%user_id, "coherence verdict unparseable, treating as ok");
                    break;
                },
            }
        }

        if self.quarantined(user_id).await? {
            return self.park_unit(&unit).await;
        }

        // Step 4: bubble formatting.
        let refiner_prompt = prompts::stable_refiner_prompt(
            persona,
            &summary,
            &draft,
            &unit.combined_text,
        );
        let (bubbles, refinement_usage) = match self.resources.router.refine(&refiner_prompt).await
        {
            Ok(refined) => (split_bubbles(&refined.text), Some(refined.usage)),
            Err(LlmError::QuotaExhausted { role }) => {
                warn!(%user_id, role, "quota exhausted during refinement, requeueing unit");
                let mut requeued = unit.clone();
                requeued.attempts = requeued.attempts.saturating_add(1);
                self.resources.broker.push_back(keys::UNITS, &requeued)?;
                return Ok(SupervisorOutcome::Requeued);
            },
            Err(err) => {
                warn!(%user_id, %err, "refinement failed, using draft as a single bubble");
                (vec![draft.clone()], None)
            },
        };

        // Step 5: safety annotation. Never blocks.
        let safety = self.resources.safety.analyze_bubbles(&bubbles);

        // Step 6: persist & enqueue.
        let interaction = Interaction {
            id: interaction_id,
            user_id,
            platform_message_id: unit.latest_message_id(),
            source_message_ids: unit.message_ids.clone(),
            platform_ts: unit.platform_ts,
            received_at: unit.received_at,
            user_text: unit.combined_text.clone(),
            generator_text: generation.text,
            draft_text: draft,
            bubbles,
            safety: safety.clone(),
            review_status: ReviewStatus::Pending,
            reviewer_id: None,
            claimed_at: None,
            reviewed_at: None,
            review_latency_secs: None,
            final_bubbles: None,
            edit_tags: Vec::new(),
            quality_score: None,
            reviewer_notes: None,
            generation_usage: generation.usage,
            coherence_usage,
            refinement_usage,
            is_recovered: unit.is_recovered,
            identity_loop_suspected,
            dispatch_state: None,
            created_at: clock::now_utc(),
        };

        let sequence = self.resources.store.insert_interaction(&interaction).await?;
        if let Some(record) = record {
            self.resources.store.insert_coherence_record(&record).await?;
        }

        let user = self.resources.store.get_user(user_id).await?;
        let review = &self.resources.config.review;
        let age_minutes =
            (clock::now_utc() - interaction.received_at).num_seconds() as f64 / 60.0;
        let priority = review_priority(
            age_minutes,
            user.value_scalar(),
            safety.risk_score,
            (review.age_weight, review.value_weight, review.risk_weight),
        );
        #[allow(clippy::cast_sign_loss)]
        self.resources.broker.zadd(
            keys::REVIEW_QUEUE,
            &interaction_id.to_string(),
            priority,
            sequence as u64,
        );

        info!(
            %user_id,
            interaction_id = %interaction_id,
            priority,
            bubbles = interaction.bubbles.len(),
            "interaction pending review"
        );
        Ok(SupervisorOutcome::Created(interaction_id))
    }

    async fn quarantined(&self, user_id: UserId) -> PipelineResult<bool> {
        Ok(self.protocol.route(user_id).await? == RouteDecision::Quarantine)
    }

    async fn park_unit(&self, unit: &ProcessingUnit) -> PipelineResult<SupervisorOutcome> {
        let parked = self
            .resources
            .store
            .quarantine_unprocessed_intake(unit.user_id, &unit.message_ids, clock::now_utc())
            .await?;
        info!(user_id = %unit.user_id, parked, "unit parked in quarantine mid-pipeline");
        Ok(SupervisorOutcome::Quarantined)
    }

    fn variant_index(&self, user_id: UserId) -> u64 {
        #[allow(clippy::cast_sign_loss)]
        {
            self.resources
                .broker
                .counter(&format!("variant:{user_id}"))
                .max(0) as u64
        }
    }

    fn rotate_variant(&self, user_id: UserId) -> u64 {
        #[allow(clippy::cast_sign_loss)]
        {
            self.resources
                .broker
                .incr(&format!("variant:{user_id}"), None)
                .max(0) as u64
        }
    }

    /// Run the coherence analysis, with one repair pass on parse failure.
    async fn coherence_check(
        &self,
        user_id: UserId,
        draft: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> PipelineResult<(Option<VerdictJson>, Option<StageUsage>)> {
        let commitments = self
            .resources
            .store
            .active_commitments_within(user_id, now, ChronoDuration::days(COMMITMENT_HORIZON_DAYS))
            .await?;
        let payload = prompts::coherence_payload(
            draft,
            &commitments,
            now,
            self.resources.config.persona.utc_offset_minutes,
        );

        let analysis = match self
            .resources
            .router
            .analyze(&prompts::coherence_directive(), &payload)
            .await
        {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(%user_id, %err, "coherence analysis call failed, treating as ok");
                return Ok((None, None));
            },
        };
        let usage = Some(analysis.usage.clone());

        if let Some(verdict) = parse_verdict(&analysis.text) {
            return Ok((Some(verdict), usage));
        }

        // One repair pass through the small model.
        match self
            .resources
            .router
            .repair(&prompts::repair_directive(), &analysis.text)
            .await
        {
            Ok(repaired) => Ok((parse_verdict(&repaired.text), usage)),
            Err(err) => {
                warn!(%user_id, %err, "verdict repair failed");
                Ok((None, usage))
            },
        }
    }

    async fn persist_new_commitments(
        &self,
        user_id: UserId,
        verdict: &VerdictJson,
        record: &mut Option<CoherenceRecord>,
    ) -> PipelineResult<()> {
        let Some(new_commitments) = &verdict.new_commitments else {
            return Ok(());
        };
        let now = clock::now_utc();
        let mut persisted = 0;
        for commitment in new_commitments {
            match chrono::DateTime::parse_from_rfc3339(&commitment.target_ts) {
                Ok(target) => {
                    self.resources
                        .store
                        .insert_commitment(
                            user_id,
                            &commitment.text,
                            target.with_timezone(&chrono::Utc),
                            now,
                        )
                        .await?;
                    persisted += 1;
                },
                Err(err) => {
                    warn!(%user_id, target = %commitment.target_ts, %err, "unparseable commitment target");
                },
            }
        }
        if let Some(record) = record {
            record.new_commitments = persisted;
        }
        Ok(())
    }
}

fn verdict_status(raw: &str) -> CoherenceStatus {
    raw.parse().unwrap_or(CoherenceStatus::Ok)
}

/// Apply an availability correction: replace the first occurrence of the
/// original span; if absent, append as a corrective clause.
fn apply_correction(draft: &str, verdict: &VerdictJson) -> (String, Option<String>, Option<String>) {
    let (Some(original), Some(replacement)) =
        (&verdict.original_span, &verdict.replacement_span)
    else {
        return (draft.to_owned(), None, None);
    };
    let corrected = if draft.contains(original.as_str()) {
        draft.replacen(original.as_str(), replacement, 1)
    } else {
        format!("{draft} (actually, {replacement})")
    };
    (
        corrected,
        Some(original.clone()),
        Some(replacement.clone()),
    )
}

/// Extract the JSON object from a model response and parse it.
fn parse_verdict(text: &str) -> Option<VerdictJson> {
    let trimmed = text.trim();
    let candidate = if trimmed.starts_with('{') {
        trimmed.to_owned()
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end <= start {
            return None;
        }
        trimmed[start..=end].to_owned()
    };
    serde_json::from_str(&candidate).ok()
}

/// Split refiner output on the bubble token, trimming and discarding empty
/// segments. Zero segments falls back to the whole text as one bubble.
fn split_bubbles(text: &str) -> Vec<String> {
    let bubbles: Vec<String> = text
        .split(BUBBLE_TOKEN)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    if bubbles.is_empty() {
        let whole = text.trim();
        if whole.is_empty() {
            vec![text.to_owned()]
        } else {
            vec![whole.to_owned()]
        }
    } else {
        bubbles
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_bubbles() {
        assert_eq!(
            split_bubbles("hey [BUBBLE] what's up [BUBBLE] "),
            vec!["hey", "what's up"]
        );
        assert_eq!(split_bubbles("no token at all"), vec!["no token at all"]);
        assert_eq!(split_bubbles("[BUBBLE][BUBBLE]x"), vec!["x"]);
    }

    #[test]
    fn test_parse_verdict_plain_and_fenced() {
        let plain = parse_verdict(r#"{"status": "ok"}"#).unwrap();
        assert_eq!(plain.status, "ok");

        let fenced = parse_verdict(
            "```json\n{\"status\": \"availability_conflict\", \"original_span\": \"at 9\", \"replacement_span\": \"after 11\"}\n```",
        )
        .unwrap();
        assert_eq!(fenced.status, "availability_conflict");
        assert_eq!(fenced.original_span.as_deref(), Some("at 9"));

        assert!(parse_verdict("sure, here's my analysis!").is_none());
    }

    #[test]
    fn test_apply_correction_replaces_first_occurrence() {
        let verdict = VerdictJson {
            status: "availability_conflict".to_owned(),
            original_span: Some("tomorrow at 9".to_owned()),
            replacement_span: Some("tomorrow after 11".to_owned()),
            new_commitments: None,
        };
        let (corrected, original, replacement) =
            apply_correction("wanna grab drinks tomorrow at 9?", &verdict);
        assert_eq!(corrected, "wanna grab drinks tomorrow after 11?");
        assert_eq!(original.as_deref(), Some("tomorrow at 9"));
        assert_eq!(replacement.as_deref(), Some("tomorrow after 11"));
    }

    #[test]
    fn test_apply_correction_appends_when_span_missing() {
        let verdict = VerdictJson {
            status: "availability_conflict".to_owned(),
            original_span: Some("not present".to_owned()),
            replacement_span: Some("after 11 works".to_owned()),
            new_commitments: None,
        };
        let (corrected, _, _) = apply_correction("let's meet at nine", &verdict);
        assert_eq!(corrected, "let's meet at nine (actually, after 11 works)");
    }

    #[test]
    fn test_unknown_status_reads_as_ok() {
        assert_eq!(verdict_status("weird"), CoherenceStatus::Ok);
        assert_eq!(
            verdict_status("identity_conflict"),
            CoherenceStatus::IdentityConflict
        );
    }
}
