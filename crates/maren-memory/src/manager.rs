//! The memory manager.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use maren_core::UserId;
use maren_store::{MemoryRow, Store};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::MemoryResult;
use crate::summary;

/// Role of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRole {
    /// A message from the user.
    User,
    /// An approved persona reply (one bubble).
    Assistant,
}

impl MemoryRole {
    const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A history entry as handed to prompt assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    /// `"user"`, `"assistant"`, or `"summary"`.
    pub role: String,
    /// Entry text.
    pub text: String,
    /// Entry timestamp.
    pub ts: DateTime<Utc>,
}

impl From<MemoryRow> for MemoryEntry {
    fn from(row: MemoryRow) -> Self {
        Self {
            role: row.role,
            text: row.text,
            ts: row.ts,
        }
    }
}

/// Memory budgets.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum entries per user.
    pub max_messages: usize,
    /// Maximum total bytes per user.
    pub max_bytes: usize,
    /// Entries returned by [`MemoryManager::recent`] by default.
    pub recent_window: usize,
    /// Days of inactivity before history is dropped.
    pub ttl_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            max_bytes: 102_400,
            recent_window: 6,
            ttl_days: 30,
        }
    }
}

/// Bounded per-user conversation memory over the store.
pub struct MemoryManager {
    store: Store,
    config: MemoryConfig,
    // Single writer per user; append and compression run under this lock.
    write_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl MemoryManager {
    /// Create a manager over the store.
    #[must_use]
    pub fn new(store: Store, config: MemoryConfig) -> Self {
        Self {
            store,
            config,
            write_locks: DashMap::new(),
        }
    }

    fn write_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append an entry and compress if a budget is exceeded.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::MemoryError`] on store failure.
    pub async fn append(
        &self,
        user_id: UserId,
        role: MemoryRole,
        text: &str,
        now: DateTime<Utc>,
    ) -> MemoryResult<()> {
        let lock = self.write_lock(user_id);
        let _guard = lock.lock().await;
        self.store
            .append_memory(user_id, role.as_str(), text, now)
            .await?;
        self.enforce_budget(user_id).await
    }

    /// Last `k` non-summary entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::MemoryError`] on store failure.
    pub async fn recent(&self, user_id: UserId, k: usize) -> MemoryResult<Vec<MemoryEntry>> {
        // Over-fetch by one so a leading summary row cannot shrink the window.
        let fetch = i64::try_from(k.saturating_add(1)).unwrap_or(i64::MAX);
        let rows = self.store.recent_memory(user_id, fetch).await?;
        let mut entries: Vec<MemoryEntry> = rows
            .into_iter()
            .filter(|row| row.role != "summary")
            .map(MemoryEntry::from)
            .collect();
        if entries.len() > k {
            entries.drain(..entries.len().saturating_sub(k));
        }
        Ok(entries)
    }

    /// Last `recent_window` entries (config default).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::MemoryError`] on store failure.
    pub async fn recent_default(&self, user_id: UserId) -> MemoryResult<Vec<MemoryEntry>> {
        self.recent(user_id, self.config.recent_window).await
    }

    /// The stable digest of compressed history. Empty string when nothing
    /// has been compressed yet; stable either way, which is the property
    /// prompt caching needs.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::MemoryError`] on store failure.
    pub async fn summary(&self, user_id: UserId) -> MemoryResult<String> {
        let rows = self.store.memory_rows(user_id).await?;
        Ok(rows
            .into_iter()
            .find(|row| row.role == "summary")
            .map(|row| row.text)
            .unwrap_or_default())
    }

    /// Erase all memory for a user (privacy request).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::MemoryError`] on store failure.
    pub async fn forget(&self, user_id: UserId) -> MemoryResult<()> {
        let lock = self.write_lock(user_id);
        let _guard = lock.lock().await;
        let removed = self.store.forget_memory(user_id).await?;
        debug!(%user_id, removed, "forgot user memory");
        Ok(())
    }

    /// Drop histories idle past the TTL. The janitor runs this.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::MemoryError`] on store failure.
    pub async fn prune_inactive(&self, now: DateTime<Utc>) -> MemoryResult<u64> {
        let cutoff = now - Duration::days(self.config.ttl_days);
        Ok(self.store.prune_inactive_memory(cutoff).await?)
    }

    /// Enforce both budgets. Caller holds the user's write lock.
    async fn enforce_budget(&self, user_id: UserId) -> MemoryResult<()> {
        let mut rows = self.store.memory_rows(user_id).await?;

        // Phase 1: drop oldest user/assistant pairs while over the entry cap.
        while rows.len() > self.config.max_messages {
            let doomed: Vec<i64> = rows
                .iter()
                .filter(|row| row.role != "summary")
                .take(2)
                .map(|row| row.id)
                .collect();
            if doomed.is_empty() {
                break;
            }
            self.store.delete_memory_rows(&doomed).await?;
            rows.retain(|row| !doomed.contains(&row.id));
        }

        // Phase 2: still over the byte budget; fold the oldest third into
        // the summary digest.
        let total_bytes: usize = rows.iter().map(|row| row.text.len()).sum();
        if total_bytes > self.config.max_bytes {
            let previous = rows
                .iter()
                .find(|row| row.role == "summary")
                .map(|row| row.text.clone());
            let non_summary: Vec<&MemoryRow> =
                rows.iter().filter(|row| row.role != "summary").collect();
            let third = (non_summary.len() / 3).max(1);
            let doomed: Vec<i64> = non_summary.iter().take(third).map(|row| row.id).collect();
            let texts: Vec<&str> = non_summary
                .iter()
                .take(third)
                .map(|row| row.text.as_str())
                .collect();
            let nickname = self
                .store
                .get_user(user_id)
                .await
                .ok()
                .and_then(|user| user.nickname);

            let digest = summary::digest(&texts, nickname.as_deref(), previous.as_deref());
            let old_summary_ids: Vec<i64> = rows
                .iter()
                .filter(|row| row.role == "summary")
                .map(|row| row.id)
                .collect();
            self.store.delete_memory_rows(&doomed).await?;
            self.store.delete_memory_rows(&old_summary_ids).await?;
            // The summary carries the timestamp of the newest folded entry.
            let ts = rows
                .iter()
                .filter(|row| doomed.contains(&row.id))
                .map(|row| row.ts)
                .max()
                .unwrap_or_else(Utc::now);
            self.store
                .append_memory(user_id, "summary", &digest, ts)
                .await?;
            debug!(%user_id, folded = doomed.len(), "compressed memory into summary");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(config: MemoryConfig) -> MemoryManager {
        let store = Store::connect_memory().await.unwrap();
        MemoryManager::new(store, config)
    }

    #[tokio::test]
    async fn test_append_and_recent() {
        let manager = manager(MemoryConfig::default()).await;
        let now = Utc::now();
        manager
            .append(UserId(1), MemoryRole::User, "hey what are you up to?", now)
            .await
            .unwrap();
        manager
            .append(UserId(1), MemoryRole::Assistant, "just studying 📚", now)
            .await
            .unwrap();
        manager
            .append(UserId(1), MemoryRole::Assistant, "you?", now)
            .await
            .unwrap();

        let recent = manager.recent(UserId(1), 6).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].role, "user");
        assert_eq!(recent[2].text, "you?");
    }

    #[tokio::test]
    async fn test_entry_cap_drops_oldest_pairs() {
        let config = MemoryConfig {
            max_messages: 4,
            ..MemoryConfig::default()
        };
        let manager = manager(config).await;
        let now = Utc::now();
        for i in 0..6 {
            manager
                .append(UserId(1), MemoryRole::User, &format!("m{i}"), now)
                .await
                .unwrap();
        }
        let recent = manager.recent(UserId(1), 10).await.unwrap();
        assert!(recent.len() <= 4);
        // The oldest entries are gone.
        assert!(!recent.iter().any(|e| e.text == "m0"));
        assert!(recent.iter().any(|e| e.text == "m5"));
    }

    #[tokio::test]
    async fn test_byte_budget_produces_summary() {
        let config = MemoryConfig {
            max_messages: 100,
            max_bytes: 400,
            ..MemoryConfig::default()
        };
        let manager = manager(config).await;
        let now = Utc::now();
        for i in 0..10 {
            manager
                .append(
                    UserId(1),
                    MemoryRole::User,
                    &format!("message number {i} about hiking mountains together"),
                    now,
                )
                .await
                .unwrap();
        }
        let summary = manager.summary(UserId(1)).await.unwrap();
        assert!(!summary.is_empty());
        assert!(summary.contains("hiking") || summary.contains("mountains"));
        // Summary rows never leak into the recent window.
        let recent = manager.recent(UserId(1), 10).await.unwrap();
        assert!(recent.iter().all(|e| e.role != "summary"));
    }

    #[tokio::test]
    async fn test_summary_stable_without_compression() {
        let manager = manager(MemoryConfig::default()).await;
        let now = Utc::now();
        manager
            .append(UserId(1), MemoryRole::User, "hello", now)
            .await
            .unwrap();
        let a = manager.summary(UserId(1)).await.unwrap();
        let b = manager.summary(UserId(1)).await.unwrap();
        assert_eq!(a, b);
        assert!(a.is_empty());
    }

    #[tokio::test]
    async fn test_forget() {
        let manager = manager(MemoryConfig::default()).await;
        let now = Utc::now();
        manager
            .append(UserId(1), MemoryRole::User, "private", now)
            .await
            .unwrap();
        manager.forget(UserId(1)).await.unwrap();
        assert!(manager.recent(UserId(1), 10).await.unwrap().is_empty());
        assert!(manager.summary(UserId(1)).await.unwrap().is_empty());
    }
}
