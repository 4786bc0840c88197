//! Activity tracker: per-user debouncing and batching.
//!
//! Rapid messages from one user are folded into a single processing unit so
//! the model is invoked once per logical utterance. A buffer releases when
//! the user has been quiet for the debounce window (and is not typing),
//! when it reaches the batch-size cap, or when the oldest buffered message
//! has waited out the maximum delay.

use std::time::Instant;

use dashmap::DashMap;
use maren_broker::keys;
use maren_core::{IntakeEntry, ProcessingUnit, UserId, clock};
use tracing::{debug, info};

use crate::error::PipelineResult;
use crate::resources::Resources;

/// Buffer TTL slack beyond the maximum wait.
const BUFFER_TTL_SLACK_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
struct BufferMeta {
    first_at: Instant,
    last_at: Instant,
}

/// Per-user debouncer/batcher.
pub struct ActivityTracker {
    resources: Resources,
    meta: DashMap<UserId, BufferMeta>,
}

impl ActivityTracker {
    /// Create a tracker over the shared resources.
    #[must_use]
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            meta: DashMap::new(),
        }
    }

    /// Accept one intake entry from a drain worker: buffer it and release
    /// immediately if the batch-size cap is reached.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on broker failure.
    pub fn accept(&self, entry: IntakeEntry) -> PipelineResult<()> {
        let user_id = entry.user_id;
        let key = keys::buffer(user_id);
        let len = self.resources.broker.push_back(&key, &entry)?;
        self.resources.broker.set_list_ttl(
            &key,
            Some(
                self.resources.debounce_max_wait()
                    + std::time::Duration::from_secs(BUFFER_TTL_SLACK_SECS),
            ),
        );

        let now = Instant::now();
        self.meta
            .entry(user_id)
            .and_modify(|meta| meta.last_at = now)
            .or_insert(BufferMeta {
                first_at: now,
                last_at: now,
            });
        debug!(%user_id, buffered = len, "message buffered");

        if len >= self.resources.config.debounce.max_batch {
            self.release(user_id)?;
        }
        Ok(())
    }

    /// Evaluate release conditions for every live buffer. Driven by the
    /// scheduler tick.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on broker failure.
    pub fn tick(&self) -> PipelineResult<()> {
        let window = self.resources.debounce_window();
        let max_wait = self.resources.debounce_max_wait();

        let due: Vec<UserId> = self
            .meta
            .iter()
            .filter(|entry| {
                let meta = entry.value();
                let typing = self
                    .resources
                    .broker
                    .get_string(&keys::typing(*entry.key()))
                    .is_some();
                let quiet = meta.last_at.elapsed() >= window && !typing;
                let aged = meta.first_at.elapsed() >= max_wait;
                quiet || aged
            })
            .map(|entry| *entry.key())
            .collect();

        for user_id in due {
            self.release(user_id)?;
        }
        Ok(())
    }

    /// Release a user's buffer to the supervisor queue as one or more
    /// processing units (chunked at the batch-size cap, arrival order
    /// preserved).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on broker failure.
    pub fn release(&self, user_id: UserId) -> PipelineResult<()> {
        self.meta.remove(&user_id);
        let entries: Vec<IntakeEntry> =
            self.resources.broker.drain_list(&keys::buffer(user_id))?;
        if entries.is_empty() {
            return Ok(());
        }
        let max_batch = self.resources.config.debounce.max_batch.max(1);
        for chunk in entries.chunks(max_batch) {
            let unit = ProcessingUnit::from_batch(chunk);
            self.resources.broker.push_back(keys::UNITS, &unit)?;
            debug!(
                %user_id,
                messages = chunk.len(),
                "processing unit released"
            );
        }
        Ok(())
    }

    /// Drain a user's pending buffer into quarantine instead of the
    /// supervisor (protocol activated while messages were buffered).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store or broker failure.
    pub async fn drain_to_quarantine(&self, user_id: UserId) -> PipelineResult<usize> {
        self.meta.remove(&user_id);
        let entries: Vec<IntakeEntry> =
            self.resources.broker.drain_list(&keys::buffer(user_id))?;
        let now = clock::now_utc();
        for entry in &entries {
            self.resources
                .store
                .quarantine_intake_entry(entry, now)
                .await?;
        }
        if !entries.is_empty() {
            info!(%user_id, count = entries.len(), "pending buffer drained to quarantine");
        }
        Ok(entries.len())
    }

    /// Number of users with live buffers.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.meta.len()
    }
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("live_buffers", &self.meta.len())
            .finish_non_exhaustive()
    }
}
