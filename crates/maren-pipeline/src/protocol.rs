//! Protocol (quarantine) manager.
//!
//! Per-user quarantine state with a read-through TTL cache over the store.
//! A single-flight guard keeps a cache expiry from stampeding the store.
//! State changes publish `protocol_changed` so the tracker and dispatcher
//! can abort per-user work immediately.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use maren_broker::{BrokerEvent, keys};
use maren_core::{
    IntakeEntry, QuarantineEntry, QuarantineEntryId, ReviewerId, UserId, clock,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::PipelineResult;
use crate::resources::Resources;

/// Cached protocol state lives this long.
const PROTOCOL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Routing decision for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Normal pipeline processing.
    Process,
    /// Park in quarantine.
    Quarantine,
}

/// Per-user quarantine state manager.
pub struct ProtocolManager {
    resources: Resources,
    // Single-flight guard per user for cache misses.
    inflight: DashMap<UserId, Arc<Mutex<()>>>,
}

impl ProtocolManager {
    /// Create a manager over the shared resources.
    #[must_use]
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            inflight: DashMap::new(),
        }
    }

    /// Route an inbound message. Cache hit is O(1); a miss loads the store
    /// under a per-user single-flight guard. Cache failures degrade to
    /// direct store reads; store failures surface.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure.
    pub async fn route(&self, user_id: UserId) -> PipelineResult<RouteDecision> {
        let key = keys::protocol(user_id);
        if let Some(cached) = self.resources.broker.get_string(&key) {
            return Ok(decision_from(&cached));
        }

        let guard = self
            .inflight
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _flight = guard.lock().await;

        // Another waiter may have filled the cache while we queued.
        if let Some(cached) = self.resources.broker.get_string(&key) {
            return Ok(decision_from(&cached));
        }

        let state = self.resources.store.protocol_state(user_id).await?;
        let value = if state.active { "active" } else { "inactive" };
        self.resources
            .broker
            .set_string(&key, value, Some(PROTOCOL_CACHE_TTL));
        Ok(decision_from(value))
    }

    /// Activate quarantine: persist, refresh the cache, cancel open review
    /// work for the user, and publish the change.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure.
    pub async fn activate(&self, user_id: UserId, actor: &ReviewerId) -> PipelineResult<()> {
        let now = clock::now_utc();
        self.resources
            .store
            .set_protocol_state(user_id, true, actor, now)
            .await?;
        self.resources.broker.set_string(
            &keys::protocol(user_id),
            "active",
            Some(PROTOCOL_CACHE_TTL),
        );

        // Anything of theirs still pending or claimed comes off the queue.
        let cancelled = self
            .resources
            .store
            .cancel_open_interactions_for_user(user_id, now)
            .await?;
        for id in &cancelled {
            self.resources
                .broker
                .zrem(keys::REVIEW_QUEUE, &id.to_string());
        }
        if !cancelled.is_empty() {
            info!(%user_id, count = cancelled.len(), "cancelled open reviews on quarantine");
        }

        self.resources.broker.publish(BrokerEvent::ProtocolChanged {
            user_id,
            active: true,
        });
        info!(%user_id, actor = %actor, "protocol activated");
        Ok(())
    }

    /// Deactivate quarantine: persist, invalidate the cache, publish.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure.
    pub async fn deactivate(&self, user_id: UserId, actor: &ReviewerId) -> PipelineResult<()> {
        let now = clock::now_utc();
        self.resources
            .store
            .set_protocol_state(user_id, false, actor, now)
            .await?;
        self.resources.broker.delete_string(&keys::protocol(user_id));
        self.resources.broker.publish(BrokerEvent::ProtocolChanged {
            user_id,
            active: false,
        });
        info!(%user_id, actor = %actor, "protocol deactivated");
        Ok(())
    }

    /// Time-ordered quarantine queue for reviewer inspection.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure.
    pub async fn quarantine_queue(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> PipelineResult<Vec<QuarantineEntry>> {
        Ok(self.resources.store.quarantine_queue(user_id, limit).await?)
    }

    /// Release one entry back into intake as a synthetic message.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] when the entry is unknown or
    /// already processed.
    pub async fn release(&self, entry_id: QuarantineEntryId) -> PipelineResult<IntakeEntry> {
        let entry = self
            .resources
            .store
            .release_quarantine(entry_id, clock::now_utc())
            .await?;
        self.resources
            .broker
            .push_back(keys::INTAKE, &entry)?;
        info!(%entry_id, user_id = %entry.user_id, "quarantine entry released to intake");
        Ok(entry)
    }

    /// Release every unprocessed entry of a user, oldest first. Returns how
    /// many were released.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure.
    pub async fn bulk_release(&self, user_id: UserId, limit: i64) -> PipelineResult<usize> {
        let entries = self.resources.store.quarantine_queue(user_id, limit).await?;
        let mut released = 0;
        for entry in entries.into_iter().filter(|e| !e.processed) {
            match self.release(entry.id).await {
                Ok(_) => released += 1,
                Err(err) => warn!(entry_id = %entry.id, %err, "bulk release skipped entry"),
            }
        }
        Ok(released)
    }

    /// Soft-delete a user's quarantine entries.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure.
    pub async fn purge(&self, user_id: UserId) -> PipelineResult<u64> {
        Ok(self
            .resources
            .store
            .purge_quarantine(user_id, clock::now_utc())
            .await?)
    }
}

fn decision_from(cached: &str) -> RouteDecision {
    if cached == "active" {
        RouteDecision::Quarantine
    } else {
        RouteDecision::Process
    }
}

impl std::fmt::Debug for ProtocolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolManager").finish_non_exhaustive()
    }
}
