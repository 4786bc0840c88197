//! The `PlatformClient` implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use maren_core::platform::{
    PlatformClient, PlatformError, PlatformMessage, PlatformResult, PlatformUser,
};
use maren_core::{PlatformMessageId, UserId};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId};

/// Per-user registry cap; old entries age out first.
const REGISTRY_CAP: usize = 500;

/// Telegram Bot API transport.
pub struct TelegramPlatform {
    bot: Bot,
    /// Message registry fed by the update stream, serving dialog listing
    /// and history diffs for recovery.
    registry: DashMap<UserId, Vec<PlatformMessage>>,
    /// Display names observed on inbound messages. Bots cannot look up
    /// arbitrary users, so this is the only name source.
    names: DashMap<UserId, String>,
}

impl TelegramPlatform {
    /// Create a transport from a bot token.
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
            registry: DashMap::new(),
            names: DashMap::new(),
        }
    }

    /// Record a display name observed on an inbound message.
    pub fn record_name(&self, user_id: UserId, name: &str) {
        self.names.insert(user_id, name.to_owned());
    }

    /// The underlying bot handle (listener wiring).
    #[must_use]
    pub(crate) fn bot(&self) -> Bot {
        self.bot.clone()
    }

    /// Record an observed inbound message into the registry.
    pub fn record(&self, message: PlatformMessage) {
        let mut entries = self.registry.entry(message.user_id).or_default();
        if entries.iter().any(|m| m.id == message.id) {
            return;
        }
        entries.push(message);
        entries.sort_by_key(|m| m.id);
        if entries.len() > REGISTRY_CAP {
            let excess = entries.len() - REGISTRY_CAP;
            entries.drain(..excess);
        }
    }

    fn map_error(err: teloxide::RequestError) -> PlatformError {
        match err {
            teloxide::RequestError::Network(e) => PlatformError::Transient(e.to_string()),
            teloxide::RequestError::Io(e) => PlatformError::Transient(e.to_string()),
            teloxide::RequestError::RetryAfter(delay) => {
                PlatformError::Transient(format!("rate limited, retry after {delay:?}"))
            },
            teloxide::RequestError::InvalidJson { source, .. } => {
                PlatformError::Transient(source.to_string())
            },
            other => PlatformError::Rejected(other.to_string()),
        }
    }
}

#[async_trait]
impl PlatformClient for TelegramPlatform {
    async fn send_message(
        &self,
        user_id: UserId,
        text: &str,
    ) -> PlatformResult<PlatformMessageId> {
        let message = self
            .bot
            .send_message(ChatId(user_id.0), text)
            .await
            .map_err(Self::map_error)?;
        Ok(PlatformMessageId(i64::from(message.id.0)))
    }

    async fn send_typing(&self, user_id: UserId) -> PlatformResult<()> {
        self.bot
            .send_chat_action(ChatId(user_id.0), ChatAction::Typing)
            .await
            .map_err(Self::map_error)?;
        Ok(())
    }

    async fn resolve_user(&self, user_id: UserId) -> PlatformResult<PlatformUser> {
        // For a bot, the chat id IS the outbound handle, and a bot can only
        // address users who messaged it first. An unknown user is therefore
        // genuinely unaddressable.
        if self.registry.contains_key(&user_id) || self.names.contains_key(&user_id) {
            Ok(PlatformUser {
                id: user_id,
                display_name: self.names.get(&user_id).map(|name| name.clone()),
            })
        } else {
            Err(PlatformError::UnresolvablePeer { user_id })
        }
    }

    async fn list_dialogs(&self) -> PlatformResult<Vec<UserId>> {
        let mut users: Vec<UserId> = self.registry.iter().map(|entry| *entry.key()).collect();
        users.sort_unstable();
        Ok(users)
    }

    async fn history_after(
        &self,
        user_id: UserId,
        after: Option<PlatformMessageId>,
        limit: usize,
    ) -> PlatformResult<Vec<PlatformMessage>> {
        let Some(entries) = self.registry.get(&user_id) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter(|m| after.is_none_or(|after| m.id > after))
            .take(limit)
            .cloned()
            .collect())
    }
}

impl std::fmt::Debug for TelegramPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramPlatform")
            .field("known_dialogs", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(user: i64, id: i64) -> PlatformMessage {
        PlatformMessage {
            id: PlatformMessageId(id),
            user_id: UserId(user),
            text: format!("m{id}"),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_registry_serves_dialogs_and_history() {
        let platform = TelegramPlatform::new("123:testtoken");
        platform.record(message(1, 10));
        platform.record(message(1, 12));
        platform.record(message(1, 11));
        platform.record(message(2, 5));
        // Duplicate records are ignored.
        platform.record(message(1, 10));

        assert_eq!(
            platform.list_dialogs().await.unwrap(),
            vec![UserId(1), UserId(2)]
        );
        let history = platform
            .history_after(UserId(1), Some(PlatformMessageId(10)), 50)
            .await
            .unwrap();
        let ids: Vec<i64> = history.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![11, 12]);
    }

    #[tokio::test]
    async fn test_resolve_only_known_users() {
        let platform = TelegramPlatform::new("123:testtoken");
        assert!(platform.resolve_user(UserId(9)).await.is_err());

        platform.record(message(9, 1));
        platform.record_name(UserId(9), "lena");
        let profile = platform.resolve_user(UserId(9)).await.unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("lena"));
    }
}
