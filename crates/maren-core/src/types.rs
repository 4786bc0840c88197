//! Durable domain entities.
//!
//! These are the rows the message store owns plus the two transient records
//! that travel through the queue broker ([`IntakeEntry`], [`ProcessingUnit`]).
//! All timestamps are UTC; persona-local time exists only inside prompt text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    CommitmentId, InteractionId, PlatformMessageId, QuarantineEntryId, RecoveryOpId, ReviewerId,
    UserId,
};

/// A platform user as known to the pipeline.
///
/// Created on first contact; customer label and lifetime value are only ever
/// written by reviewer actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Stable platform identifier.
    pub id: UserId,
    /// Display nickname, reviewer-editable.
    pub nickname: Option<String>,
    /// Current customer label (e.g. "prospect", "vip").
    pub customer_status: Option<String>,
    /// Lifetime-value scalar, normalized into `[0, 1]` for priority scoring.
    pub lifetime_value: f64,
    /// First-contact timestamp.
    pub created_at: DateTime<Utc>,
    /// Last reviewer update.
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A brand-new user row for first contact.
    #[must_use]
    pub fn first_contact(id: UserId, nickname: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            nickname,
            customer_status: None,
            // Mid-range default: unknown users are neither boosted nor buried.
            lifetime_value: 0.5,
            created_at: now,
            updated_at: now,
        }
    }

    /// Value scalar used by review-priority scoring, clamped to `[0, 1]`.
    #[must_use]
    pub fn value_scalar(&self) -> f64 {
        self.lifetime_value.clamp(0.0, 1.0)
    }
}

/// Review lifecycle of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting in the review queue.
    Pending,
    /// Claimed by a reviewer.
    Claimed,
    /// Approved; bubbles handed to the dispatcher.
    Approved,
    /// Rejected; the user receives nothing.
    Rejected,
    /// Cancelled (quarantine activated mid-review).
    Cancelled,
}

impl ReviewStatus {
    /// Stable string form used in SQL and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this is a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown review status: {other}")),
        }
    }
}

/// Outcome of the dispatch attempt for an approved interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// All bubbles delivered.
    Sent,
    /// Outbound handle could not be resolved after retries.
    Failed,
    /// Quarantine activated between approval and delivery.
    CancelledQuarantine,
}

impl DispatchState {
    /// Stable string form used in SQL.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::CancelledQuarantine => "cancelled_quarantine",
        }
    }
}

impl std::str::FromStr for DispatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled_quarantine" => Ok(Self::CancelledQuarantine),
            other => Err(format!("unknown dispatch state: {other}")),
        }
    }
}

/// Token usage and cost for one model invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageUsage {
    /// Model that actually served the call (after fallbacks).
    pub model: String,
    /// Prompt tokens.
    pub tokens_in: u64,
    /// Completion tokens.
    pub tokens_out: u64,
    /// Prompt tokens served from the provider cache.
    pub cached_tokens: u64,
    /// Cost in USD computed from pricing config.
    pub cost_usd: f64,
}

impl StageUsage {
    /// Fraction of prompt tokens served from cache, `0.0` when unknown.
    #[must_use]
    pub fn cache_ratio(&self) -> f64 {
        if self.tokens_in == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.cached_tokens as f64 / self.tokens_in as f64
            }
        }
    }
}

/// Deterministic safety annotation. Never blocks, only informs the reviewer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyAnnotation {
    /// Maximum weighted category hit, in `[0, 1]`.
    pub risk_score: f64,
    /// Matched category tags.
    pub flags: Vec<String>,
}

/// One user message (or debounced batch) and everything the pipeline
/// produced for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Unique id.
    pub id: InteractionId,
    /// The user this exchange belongs to.
    pub user_id: UserId,
    /// Latest contributing platform message id.
    pub platform_message_id: PlatformMessageId,
    /// Every platform message id folded into this interaction by debouncing.
    pub source_message_ids: Vec<PlatformMessageId>,
    /// Platform-side send time of the latest contributing message.
    pub platform_ts: DateTime<Utc>,
    /// When the (first) message entered the intake log.
    pub received_at: DateTime<Utc>,
    /// Raw user text; batched messages joined with a single newline.
    pub user_text: String,
    /// Raw generation-stage output, before any coherence correction.
    pub generator_text: String,
    /// Draft after coherence correction, as handed to the bubble refiner.
    pub draft_text: String,
    /// Refinement-stage output: the ordered bubble sequence shown to the
    /// reviewer as the proposed reply.
    pub bubbles: Vec<String>,
    /// Safety annotation over the bubbles.
    pub safety: SafetyAnnotation,
    /// Review lifecycle state.
    pub review_status: ReviewStatus,
    /// Reviewer who claimed/resolved the item.
    pub reviewer_id: Option<ReviewerId>,
    /// When the item was claimed.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal review state.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Seconds from enqueue to terminal review state.
    pub review_latency_secs: Option<f64>,
    /// Reviewer-approved bubbles (possibly edited).
    pub final_bubbles: Option<Vec<String>>,
    /// Edit taxonomy tags applied on approval.
    pub edit_tags: Vec<String>,
    /// Reviewer quality score, 1..=5.
    pub quality_score: Option<u8>,
    /// Free-form reviewer note, editable post-approval for audit.
    pub reviewer_notes: Option<String>,
    /// Generation-stage usage.
    pub generation_usage: StageUsage,
    /// Coherence-analysis usage, when the check ran.
    pub coherence_usage: Option<StageUsage>,
    /// Bubble-refinement usage.
    pub refinement_usage: Option<StageUsage>,
    /// Whether this interaction was re-ingested by a recovery pass.
    pub is_recovered: bool,
    /// Set when the generator looped on identity conflicts and the latest
    /// draft was accepted anyway.
    pub identity_loop_suspected: bool,
    /// Dispatch outcome, present only after the dispatcher touched it.
    pub dispatch_state: Option<DispatchState>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    /// Total cost across all pipeline stages.
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        self.generation_usage.cost_usd
            + self.coherence_usage.as_ref().map_or(0.0, |u| u.cost_usd)
            + self.refinement_usage.as_ref().map_or(0.0, |u| u.cost_usd)
    }
}

/// Per-user quarantine ("silence") state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolState {
    /// The user the state belongs to.
    pub user_id: UserId,
    /// Whether quarantine is active.
    pub active: bool,
    /// Last state change.
    pub last_changed_at: DateTime<Utc>,
    /// Reviewer who flipped the state.
    pub actor: Option<ReviewerId>,
}

/// A message parked in quarantine instead of entering the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// Unique id.
    pub id: QuarantineEntryId,
    /// Sender.
    pub user_id: UserId,
    /// Platform message id of the parked message.
    pub platform_message_id: PlatformMessageId,
    /// Raw text, preserved verbatim.
    pub text: String,
    /// When the message was quarantined.
    pub quarantined_at: DateTime<Utc>,
    /// Whether a reviewer already released or dismissed it.
    pub processed: bool,
    /// When the entry was released back into intake.
    pub released_at: Option<DateTime<Utc>>,
    /// Soft-delete marker (30-day retention after purge).
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a tracked persona commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    /// Still pending; participates in coherence checks.
    Active,
    /// The persona followed through.
    Fulfilled,
    /// Target time passed without follow-through.
    Expired,
}

impl CommitmentStatus {
    /// Stable string form used in SQL.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Fulfilled => "fulfilled",
            Self::Expired => "expired",
        }
    }
}

impl std::str::FromStr for CommitmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "fulfilled" => Ok(Self::Fulfilled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown commitment status: {other}")),
        }
    }
}

/// A short textual promise the persona made, tracked to detect later
/// contradictions ("I'll text you after my exam").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitment {
    /// Unique id.
    pub id: CommitmentId,
    /// User the promise was made to.
    pub user_id: UserId,
    /// The promise text as extracted by coherence analysis.
    pub text: String,
    /// When the promise falls due.
    pub target_ts: DateTime<Utc>,
    /// Lifecycle state.
    pub status: CommitmentStatus,
    /// Extraction time.
    pub created_at: DateTime<Utc>,
}

/// Verdict of a coherence analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoherenceStatus {
    /// Draft is consistent.
    Ok,
    /// Draft clashes with an active commitment's schedule.
    AvailabilityConflict,
    /// Draft contradicts the persona's identity constraints.
    IdentityConflict,
}

impl CoherenceStatus {
    /// Stable string form used in SQL and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AvailabilityConflict => "availability_conflict",
            Self::IdentityConflict => "identity_conflict",
        }
    }
}

impl std::str::FromStr for CoherenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "availability_conflict" => Ok(Self::AvailabilityConflict),
            "identity_conflict" => Ok(Self::IdentityConflict),
            other => Err(format!("unknown coherence status: {other}")),
        }
    }
}

/// Per-interaction record of what the coherence check decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceRecord {
    /// Interaction the verdict belongs to.
    pub interaction_id: InteractionId,
    /// The verdict.
    pub status: CoherenceStatus,
    /// Conflicting span in the original draft, when a correction was made.
    pub original_span: Option<String>,
    /// Replacement span applied to the draft.
    pub replacement_span: Option<String>,
    /// Number of new commitments extracted from the draft.
    pub new_commitments: u32,
    /// Analysis time.
    pub created_at: DateTime<Utc>,
}

/// What started a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    /// Ran automatically at process startup.
    Startup,
    /// Requested via the reviewer API.
    Manual,
    /// Fired by a schedule.
    Scheduled,
}

impl RecoveryTrigger {
    /// Stable string form used in SQL and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::str::FromStr for RecoveryTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "startup" => Ok(Self::Startup),
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown recovery trigger: {other}")),
        }
    }
}

/// Terminal status of a recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Still scanning.
    Running,
    /// Finished; counters are final.
    Completed,
    /// Aborted (circuit breaker or fatal error).
    Failed,
}

impl RecoveryStatus {
    /// Stable string form used in SQL and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RecoveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown recovery status: {other}")),
        }
    }
}

/// One bounded reconciliation pass over platform history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOperation {
    /// Unique id.
    pub id: RecoveryOpId,
    /// What started the pass.
    pub trigger: RecoveryTrigger,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time, absent while running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Messages re-ingested immediately (age < tier-1 bound).
    pub tier1_count: u32,
    /// Messages re-ingested with tier-2 pacing.
    pub tier2_count: u32,
    /// Messages re-ingested with tier-3 pacing.
    pub tier3_count: u32,
    /// Messages logged and skipped (older than the max age).
    pub skipped_count: u32,
    /// Users examined.
    pub users_examined: u32,
    /// Errors encountered, newest last.
    pub errors: Vec<String>,
    /// Terminal status.
    pub status: RecoveryStatus,
}

impl RecoveryOperation {
    /// A fresh running operation.
    #[must_use]
    pub fn begin(trigger: RecoveryTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: RecoveryOpId::new(),
            trigger,
            started_at: now,
            finished_at: None,
            tier1_count: 0,
            tier2_count: 0,
            tier3_count: 0,
            skipped_count: 0,
            users_examined: 0,
            errors: Vec::new(),
            status: RecoveryStatus::Running,
        }
    }

    /// Total messages re-ingested across tiers.
    #[must_use]
    pub const fn ingested_total(&self) -> u32 {
        self.tier1_count + self.tier2_count + self.tier3_count
    }
}

/// Reviewer-facing projection of a pending interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    /// The pending interaction.
    pub interaction_id: InteractionId,
    /// Sender.
    pub user_id: UserId,
    /// Priority scalar in `[0, 1]`; higher is reviewed sooner.
    pub priority: f64,
    /// Monotonic insertion sequence, FIFO tiebreak within equal priority.
    pub sequence: u64,
    /// When the item entered the review queue.
    pub enqueued_at: DateTime<Utc>,
    /// Safety risk input to the priority formula.
    pub risk_score: f64,
    /// User-value input to the priority formula.
    pub user_value: f64,
}

/// An approved reply queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    /// The approved interaction.
    pub interaction_id: InteractionId,
    /// Recipient.
    pub user_id: UserId,
    /// Reviewer-approved bubbles, in delivery order.
    pub bubbles: Vec<String>,
}

/// Review-priority formula: weighted sum of item age (capped at one hour),
/// the sender's value scalar, and the safety risk score. Range `[0, 1]`
/// when the weights sum to 1.
#[must_use]
pub fn review_priority(
    age_minutes: f64,
    user_value: f64,
    risk_score: f64,
    weights: (f64, f64, f64),
) -> f64 {
    let (age_weight, value_weight, risk_weight) = weights;
    age_weight * (age_minutes / 60.0).clamp(0.0, 1.0)
        + value_weight * user_value.clamp(0.0, 1.0)
        + risk_weight * risk_score.clamp(0.0, 1.0)
}

/// One record in the durable intake log.
///
/// This is the authoritative transient buffer between ingress and the
/// supervisor; everything else in the broker can be rebuilt from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeEntry {
    /// Sender.
    pub user_id: UserId,
    /// Platform message id.
    pub platform_message_id: PlatformMessageId,
    /// Raw text.
    pub text: String,
    /// Platform-side send time.
    pub platform_ts: DateTime<Utc>,
    /// When ingress accepted the message.
    pub received_at: DateTime<Utc>,
    /// Set when a recovery pass re-ingested this message.
    #[serde(default)]
    pub is_recovered: bool,
    /// Set when a reviewer released this message from quarantine.
    #[serde(default)]
    pub released_from_quarantine: bool,
}

/// A debounced batch released by the activity tracker to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingUnit {
    /// Sender.
    pub user_id: UserId,
    /// Message texts joined in arrival order with a single newline.
    pub combined_text: String,
    /// Every contributing platform message id, in arrival order.
    pub message_ids: Vec<PlatformMessageId>,
    /// Platform send time of the newest contributing message.
    pub platform_ts: DateTime<Utc>,
    /// Intake time of the first contributing message.
    pub received_at: DateTime<Utc>,
    /// Whether any contributing message came from recovery.
    #[serde(default)]
    pub is_recovered: bool,
    /// Supervisor retry count for this unit.
    #[serde(default)]
    pub attempts: u32,
}

impl ProcessingUnit {
    /// Fold a batch of intake entries (arrival order) into one unit.
    ///
    /// # Panics
    ///
    /// Never panics for non-empty input; callers must not pass an empty batch.
    #[must_use]
    pub fn from_batch(entries: &[IntakeEntry]) -> Self {
        debug_assert!(!entries.is_empty(), "batch must be non-empty");
        let combined_text = entries
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let newest = entries
            .iter()
            .max_by_key(|e| e.platform_message_id)
            .map_or_else(Utc::now, |e| e.platform_ts);
        Self {
            user_id: entries[0].user_id,
            combined_text,
            message_ids: entries.iter().map(|e| e.platform_message_id).collect(),
            platform_ts: newest,
            received_at: entries[0].received_at,
            is_recovered: entries.iter().any(|e| e.is_recovered),
            attempts: 0,
        }
    }

    /// Latest contributing platform message id.
    #[must_use]
    pub fn latest_message_id(&self) -> PlatformMessageId {
        self.message_ids
            .iter()
            .copied()
            .max()
            .unwrap_or(PlatformMessageId(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: i64, text: &str) -> IntakeEntry {
        IntakeEntry {
            user_id: UserId(1),
            platform_message_id: PlatformMessageId(id),
            text: text.to_string(),
            platform_ts: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            received_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap(),
            is_recovered: false,
            released_from_quarantine: false,
        }
    }

    #[test]
    fn test_unit_from_batch_joins_with_newline() {
        let unit = ProcessingUnit::from_batch(&[
            entry(200, "hi"),
            entry(201, "you there"),
            entry(202, "??"),
        ]);
        assert_eq!(unit.combined_text, "hi\nyou there\n??");
        assert_eq!(
            unit.message_ids,
            vec![
                PlatformMessageId(200),
                PlatformMessageId(201),
                PlatformMessageId(202)
            ]
        );
        assert_eq!(unit.latest_message_id(), PlatformMessageId(202));
    }

    #[test]
    fn test_unit_inherits_recovered_flag() {
        let mut second = entry(301, "late one");
        second.is_recovered = true;
        let unit = ProcessingUnit::from_batch(&[entry(300, "a"), second]);
        assert!(unit.is_recovered);
    }

    #[test]
    fn test_review_status_roundtrip() {
        for status in [
            ReviewStatus::Pending,
            ReviewStatus::Claimed,
            ReviewStatus::Approved,
            ReviewStatus::Rejected,
            ReviewStatus::Cancelled,
        ] {
            let parsed: ReviewStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("nonsense".parse::<ReviewStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ReviewStatus::Pending.is_terminal());
        assert!(!ReviewStatus::Claimed.is_terminal());
        assert!(ReviewStatus::Approved.is_terminal());
        assert!(ReviewStatus::Rejected.is_terminal());
        assert!(ReviewStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_cache_ratio() {
        let usage = StageUsage {
            model: "m".into(),
            tokens_in: 2000,
            tokens_out: 100,
            cached_tokens: 1500,
            cost_usd: 0.0,
        };
        assert!((usage.cache_ratio() - 0.75).abs() < f64::EPSILON);
        assert!(StageUsage::default().cache_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn test_user_value_scalar_clamped() {
        let mut user = User::first_contact(UserId(9), None, Utc::now());
        assert!((user.value_scalar() - 0.5).abs() < f64::EPSILON);
        user.lifetime_value = 7.3;
        assert!((user.value_scalar() - 1.0).abs() < f64::EPSILON);
    }
}
