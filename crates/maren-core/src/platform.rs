//! Chat-platform seam.
//!
//! The platform client library is an external collaborator. Everything the
//! pipeline needs from it is expressed by [`PlatformClient`]; the concrete
//! transport (Telegram) lives in its own crate and nothing else may import
//! it. Tests substitute a scripted implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::ids::{PlatformMessageId, UserId};

/// Errors surfaced by the chat transport.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Network failure, timeout, or platform 5xx. Retryable.
    #[error("transient platform error: {0}")]
    Transient(String),

    /// The platform refused to resolve an outbound address for the user.
    #[error("unresolvable peer: {user_id}")]
    UnresolvablePeer {
        /// The user whose address could not be resolved.
        user_id: UserId,
    },

    /// The platform rejected the request outright (bad token, forbidden).
    #[error("platform rejected request: {0}")]
    Rejected(String),
}

impl PlatformError {
    /// Classify into the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientExternal,
            Self::UnresolvablePeer { .. } => ErrorKind::NotFound,
            Self::Rejected(_) => ErrorKind::Fatal,
        }
    }
}

/// Result alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// A platform-side user profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformUser {
    /// Stable platform id.
    pub id: UserId,
    /// Display name, when the platform exposes one.
    pub display_name: Option<String>,
}

/// A message as fetched from platform history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformMessage {
    /// Platform message id.
    pub id: PlatformMessageId,
    /// Sender.
    pub user_id: UserId,
    /// Message text.
    pub text: String,
    /// Platform-side send time.
    pub sent_at: DateTime<Utc>,
}

/// An inbound platform event as delivered to the ingress adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlatformEvent {
    /// A new private message arrived.
    Message(PlatformMessage),
    /// The user's typing state changed.
    Typing {
        /// The user who is (or stopped) typing.
        user_id: UserId,
        /// `true` while the user is composing.
        active: bool,
    },
}

/// The pipeline's view of the chat transport.
///
/// All methods are subject to the platform timeout; implementations must
/// translate their transport errors into [`PlatformError`].
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Send one message bubble to a user. Returns the platform id assigned
    /// to the outbound message.
    async fn send_message(&self, user_id: UserId, text: &str)
    -> PlatformResult<PlatformMessageId>;

    /// Show a typing indicator to the user. Best-effort; implementations
    /// should not retry.
    async fn send_typing(&self, user_id: UserId) -> PlatformResult<()>;

    /// Resolve a user's profile, warming any transport-side address cache
    /// so the user stays reachable for later outbound sends.
    async fn resolve_user(&self, user_id: UserId) -> PlatformResult<PlatformUser>;

    /// List the user ids of every private dialog the persona has.
    async fn list_dialogs(&self) -> PlatformResult<Vec<UserId>>;

    /// Fetch messages from the user strictly newer than `after`, oldest
    /// first, up to `limit`. `None` fetches from the beginning of history.
    async fn history_after(
        &self,
        user_id: UserId,
        after: Option<PlatformMessageId>,
        limit: usize,
    ) -> PlatformResult<Vec<PlatformMessage>>;
}
