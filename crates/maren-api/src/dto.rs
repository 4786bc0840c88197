//! Request/response payloads.
//!
//! Validation lives here, at the boundary; the core only ever sees
//! validated values.

use chrono::{DateTime, Utc};
use maren_core::{InteractionId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Maximum bubbles per approval.
const MAX_FINAL_BUBBLES: usize = 10;
/// Maximum characters per bubble.
const MAX_BUBBLE_CHARS: usize = 4096;
/// Maximum edit tags per approval.
const MAX_EDIT_TAGS: usize = 20;
/// Maximum reviewer-note length.
const MAX_NOTE_CHARS: usize = 1000;

/// One queue entry as shown to reviewers.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItemDto {
    /// Interaction id.
    pub interaction_id: InteractionId,
    /// Sender.
    pub user_id: UserId,
    /// Live priority (rescored by age at read time).
    pub priority: f64,
    /// FIFO tiebreak sequence.
    pub sequence: i64,
    /// When the item entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Safety risk input.
    pub risk_score: f64,
    /// User-value input.
    pub user_value: f64,
    /// The user's (possibly batched) text.
    pub user_text: String,
    /// Proposed bubbles.
    pub bubbles: Vec<String>,
    /// Whether this came from a recovery pass.
    pub is_recovered: bool,
}

/// `GET /reviews/pending` response.
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    /// Items in non-increasing priority order.
    pub items: Vec<ReviewItemDto>,
    /// Opaque cursor for the next page, absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Reviewer-facing system status flags.
    pub system_status: SystemStatus,
}

/// Banner flags for the reviewer UI.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemStatus {
    /// The model chain is out of quota.
    pub llm_degraded: bool,
    /// The approved list is above its watermark.
    pub approved_backlog: bool,
    /// The intake list is above its watermark.
    pub intake_backlog: bool,
}

/// `POST /reviews/{id}/approve` body.
#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    /// Final bubbles, 1..=10, each 1..=4096 chars.
    pub final_bubbles: Vec<String>,
    /// Edit taxonomy tags, at most 20, whitelist-checked.
    #[serde(default)]
    pub edit_tags: Vec<String>,
    /// Quality score, 1..=5.
    pub quality_score: u8,
    /// Optional note, at most 1000 chars, HTML-escaped on write.
    #[serde(default)]
    pub reviewer_notes: Option<String>,
}

impl ApproveRequest {
    /// Validate against the whitelist and the size contract. Returns the
    /// HTML-escaped note.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Validation`] for any contract violation.
    pub fn validate(&self, tag_whitelist: &[String]) -> ApiResult<Option<String>> {
        if self.final_bubbles.is_empty() || self.final_bubbles.len() > MAX_FINAL_BUBBLES {
            return Err(ApiError::Validation(format!(
                "final_bubbles must have 1..={MAX_FINAL_BUBBLES} entries"
            )));
        }
        for (index, bubble) in self.final_bubbles.iter().enumerate() {
            if bubble.is_empty() || bubble.chars().count() > MAX_BUBBLE_CHARS {
                return Err(ApiError::Validation(format!(
                    "bubble {index} must be 1..={MAX_BUBBLE_CHARS} chars"
                )));
            }
        }
        if self.edit_tags.len() > MAX_EDIT_TAGS {
            return Err(ApiError::Validation(format!(
                "at most {MAX_EDIT_TAGS} edit tags"
            )));
        }
        for tag in &self.edit_tags {
            if !tag_whitelist.contains(tag) {
                return Err(ApiError::Validation(format!("unknown edit tag: {tag}")));
            }
        }
        if !(1..=5).contains(&self.quality_score) {
            return Err(ApiError::Validation("quality_score must be 1..=5".into()));
        }
        match &self.reviewer_notes {
            Some(notes) if notes.chars().count() > MAX_NOTE_CHARS => Err(ApiError::Validation(
                format!("reviewer_notes must be at most {MAX_NOTE_CHARS} chars"),
            )),
            Some(notes) => Ok(Some(escape_html(notes))),
            None => Ok(None),
        }
    }
}

/// `POST /reviews/{id}/reject` body.
#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    /// Why the draft was rejected.
    pub reason: String,
}

/// `POST /interactions/{id}/reviewer-notes` body.
#[derive(Debug, Deserialize)]
pub struct NotesRequest {
    /// The new note, at most 1000 chars.
    pub reviewer_notes: String,
}

impl NotesRequest {
    /// Validate and escape.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Validation`] when the note is too long.
    pub fn validate(&self) -> ApiResult<String> {
        if self.reviewer_notes.chars().count() > MAX_NOTE_CHARS {
            return Err(ApiError::Validation(format!(
                "reviewer_notes must be at most {MAX_NOTE_CHARS} chars"
            )));
        }
        Ok(escape_html(&self.reviewer_notes))
    }
}

/// `POST /users/{id}/customer-status` body.
#[derive(Debug, Deserialize)]
pub struct CustomerStatusRequest {
    /// New customer label; null clears it.
    pub customer_status: Option<String>,
    /// Lifetime-value scalar in `[0, 1]`.
    #[serde(default = "default_lifetime_value")]
    pub lifetime_value: f64,
}

const fn default_lifetime_value() -> f64 {
    0.5
}

/// `POST /users/{id}/nickname` body.
#[derive(Debug, Deserialize)]
pub struct NicknameRequest {
    /// New display nickname.
    pub nickname: String,
}

/// `POST /models/profile` body.
#[derive(Debug, Deserialize)]
pub struct ProfileRequest {
    /// Profile name to activate.
    pub name: String,
}

/// Minimal HTML escaping for stored reviewer text.
#[must_use]
pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approve(bubbles: Vec<&str>) -> ApproveRequest {
        ApproveRequest {
            final_bubbles: bubbles.into_iter().map(str::to_owned).collect(),
            edit_tags: Vec::new(),
            quality_score: 4,
            reviewer_notes: None,
        }
    }

    #[test]
    fn test_approve_validation() {
        let whitelist = vec!["TONE".to_owned()];
        assert!(approve(vec!["hey"]).validate(&whitelist).is_ok());
        assert!(approve(vec![]).validate(&whitelist).is_err());
        assert!(approve(vec![""]).validate(&whitelist).is_err());

        let mut request = approve(vec!["hey"]);
        request.quality_score = 6;
        assert!(request.validate(&whitelist).is_err());

        let mut request = approve(vec!["hey"]);
        request.edit_tags = vec!["NOT_A_TAG".to_owned()];
        assert!(request.validate(&whitelist).is_err());

        let mut request = approve(vec!["hey"]);
        request.edit_tags = vec!["TONE".to_owned()];
        assert!(request.validate(&whitelist).is_ok());
    }

    #[test]
    fn test_notes_escaped() {
        let mut request = approve(vec!["hey"]);
        request.reviewer_notes = Some("<script>alert('x')</script>".to_owned());
        let escaped = request.validate(&[]).unwrap().unwrap();
        assert!(!escaped.contains('<'));
        assert!(escaped.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_escape_html_ampersand_first() {
        assert_eq!(escape_html("&lt;"), "&amp;lt;");
    }
}
