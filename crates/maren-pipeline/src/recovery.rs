//! Recovery agent: leave no message behind.
//!
//! On startup and on demand, reconciles platform history with the store:
//! scans dialogs, diffs each user's history against the processing cursor,
//! and re-ingests the gap through the normal intake path with age-tiered
//! pacing. Hard caps bound every run; a circuit breaker stops a run that
//! keeps hitting platform errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use maren_core::{
    IntakeEntry, PlatformMessage, RecoveryOperation, RecoveryStatus, RecoveryTrigger, UserId,
    clock,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::ingress::{IngestOutcome, IngressAdapter};
use crate::resources::Resources;

/// History page size per platform request.
const HISTORY_PAGE: usize = 50;

/// Age tier of a recovered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    One,
    Two,
    Three,
    Skip,
}

/// Token bucket for the platform request budget.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst),
            tokens: f64::from(burst),
            refill_per_sec: f64::from(rate_per_sec),
            last_refill: Instant::now(),
        }
    }

    /// Wait until a token is available, then take it.
    async fn acquire(&mut self) {
        loop {
            let elapsed = self.last_refill.elapsed().as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = Instant::now();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let wait = (1.0 - self.tokens) / self.refill_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(wait.max(0.001))).await;
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_errors: u32,
    open_until: Option<Instant>,
}

/// The recovery agent. One instance per daemon; runs never overlap.
pub struct RecoveryAgent {
    resources: Resources,
    ingress: Arc<IngressAdapter>,
    running: AtomicBool,
    breaker: Mutex<BreakerState>,
}

impl RecoveryAgent {
    /// Create the agent over the shared resources.
    #[must_use]
    pub fn new(resources: Resources, ingress: Arc<IngressAdapter>) -> Self {
        Self {
            resources,
            ingress,
            running: AtomicBool::new(false),
            breaker: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a pass is active right now.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Seconds until the breaker closes, if it is open.
    pub async fn breaker_open_for(&self) -> Option<u64> {
        let breaker = self.breaker.lock().await;
        breaker.open_until.and_then(|until| {
            let now = Instant::now();
            (until > now).then(|| (until - now).as_secs().max(1))
        })
    }

    /// Run one bounded recovery pass.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyRunning`] when a pass is active and
    /// [`PipelineError::CircuitOpen`] while the breaker cools down.
    pub async fn run(&self, trigger: RecoveryTrigger) -> PipelineResult<RecoveryOperation> {
        if let Some(retry_after_secs) = self.breaker_open_for().await {
            return Err(PipelineError::CircuitOpen { retry_after_secs });
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::AlreadyRunning);
        }

        let result = self.run_inner(trigger).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn run_inner(&self, trigger: RecoveryTrigger) -> PipelineResult<RecoveryOperation> {
        let config = &self.resources.config.recovery;
        let mut op = RecoveryOperation::begin(trigger, clock::now_utc());
        self.resources.store.insert_recovery_op(&op).await?;
        info!(op_id = %op.id, trigger = trigger.as_str(), "recovery pass started");

        let mut bucket = TokenBucket::new(config.rate_per_sec, config.burst);

        // 1. Scan dialogs.
        bucket.acquire().await;
        let dialogs = match self.platform_call(self.resources.platform.list_dialogs()).await {
            Ok(dialogs) => {
                self.note_success().await;
                dialogs
            },
            Err(err) => {
                op.errors.push(format!("dialog scan failed: {err}"));
                return self.finish(op, RecoveryStatus::Failed).await;
            },
        };
        let users: Vec<UserId> = dialogs
            .into_iter()
            .take(config.max_users_per_run as usize)
            .collect();
        op.users_examined = u32::try_from(users.len()).unwrap_or(u32::MAX);

        // 2. Bulk cursor fetch, one round trip.
        let cursors = self.resources.store.cursors_for(&users).await?;

        // 3. Fetch each user's gap under the rate budget. The bucket is
        // shared; per-user fetches run with bounded concurrency.
        let bucket = Arc::new(Mutex::new(bucket));
        let max_total = config.max_messages_per_run as usize;
        let fetches = futures::stream::iter(users.into_iter().map(|user_id| {
            let bucket = Arc::clone(&bucket);
            let cursor = cursors.get(&user_id).copied();
            async move {
                let mut messages = Vec::new();
                let mut after = cursor;
                loop {
                    bucket.lock().await.acquire().await;
                    match self
                        .platform_call(self.resources.platform.history_after(
                            user_id,
                            after,
                            HISTORY_PAGE,
                        ))
                        .await
                    {
                        Ok(page) => {
                            self.note_success().await;
                            if page.is_empty() {
                                break;
                            }
                            after = page.iter().map(|m| m.id).max();
                            messages.extend(page);
                            if messages.len() >= max_total {
                                break;
                            }
                        },
                        Err(err) => {
                            return (user_id, Err(err));
                        },
                    }
                }
                (user_id, Ok(messages))
            }
        }))
        .buffer_unordered(config.worker_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        // 4. Classify and ingest, tier by tier. The cursor may only move to
        // ids this run actually handled: tiered for ingest, or deliberately
        // skipped by age. Messages cut off by the per-run message cap stay
        // below the cursor so the next pass refetches them.
        let mut tier1 = Vec::new();
        let mut tier2 = Vec::new();
        let mut tier3 = Vec::new();
        let mut newest_handled: HashMap<UserId, maren_core::PlatformMessageId> = HashMap::new();
        let mut total = 0usize;
        for (user_id, fetched) in fetches {
            match fetched {
                Ok(messages) => {
                    for message in messages {
                        if total >= max_total {
                            info!(
                                %user_id,
                                message_id = %message.id,
                                "recovery message cap reached, left for next pass"
                            );
                            break;
                        }
                        newest_handled
                            .entry(user_id)
                            .and_modify(|newest| *newest = (*newest).max(message.id))
                            .or_insert(message.id);
                        match self.classify(&message) {
                            Tier::One => tier1.push(message),
                            Tier::Two => tier2.push(message),
                            Tier::Three => tier3.push(message),
                            Tier::Skip => {
                                op.skipped_count += 1;
                                info!(
                                    %user_id,
                                    message_id = %message.id,
                                    "recovery skipped message past max age"
                                );
                                continue;
                            },
                        }
                        total += 1;
                    }
                },
                Err(err) => {
                    op.errors.push(format!("history fetch for {user_id}: {err}"));
                    if self.note_failure().await {
                        op.errors.push("circuit breaker tripped".to_owned());
                        return self.finish(op, RecoveryStatus::Failed).await;
                    }
                },
            }
        }

        op.tier1_count = self.ingest_tier(&tier1, None, config.batch_size).await?;
        op.tier2_count = self
            .ingest_tier(
                &tier2,
                Some(Duration::from_secs(config.tier2_pacing_seconds)),
                config.batch_size,
            )
            .await?;
        op.tier3_count = self
            .ingest_tier(
                &tier3,
                Some(Duration::from_secs(config.tier3_pacing_seconds)),
                config.batch_size,
            )
            .await?;

        // Only after the appends: advance each cursor to the newest id this
        // run handled, age-skipped messages included, so the next pass does
        // not refetch them and a crash before this point loses nothing.
        for (user_id, newest) in newest_handled {
            self.resources
                .store
                .advance_cursor(user_id, newest, clock::now_utc())
                .await?;
        }

        self.finish(op, RecoveryStatus::Completed).await
    }

    async fn finish(
        &self,
        mut op: RecoveryOperation,
        status: RecoveryStatus,
    ) -> PipelineResult<RecoveryOperation> {
        op.status = status;
        op.finished_at = Some(clock::now_utc());
        self.resources.store.update_recovery_op(&op).await?;
        info!(
            op_id = %op.id,
            status = status.as_str(),
            ingested = op.ingested_total(),
            skipped = op.skipped_count,
            errors = op.errors.len(),
            "recovery pass finished"
        );
        Ok(op)
    }

    fn classify(&self, message: &PlatformMessage) -> Tier {
        let config = &self.resources.config.recovery;
        let age_hours = (Utc::now() - message.sent_at).num_hours();
        if age_hours < config.tier1_max_hours {
            Tier::One
        } else if age_hours < config.tier2_max_hours {
            Tier::Two
        } else if age_hours < config.max_age_hours {
            Tier::Three
        } else {
            Tier::Skip
        }
    }

    /// Ingest a tier in batches, pacing between batches.
    async fn ingest_tier(
        &self,
        messages: &[PlatformMessage],
        pacing: Option<Duration>,
        batch_size: usize,
    ) -> PipelineResult<u32> {
        let mut ingested = 0;
        for (index, batch) in messages.chunks(batch_size.max(1)).enumerate() {
            if index > 0 {
                if let Some(pause) = pacing {
                    tokio::time::sleep(pause).await;
                }
            }
            for message in batch {
                let entry = IntakeEntry {
                    user_id: message.user_id,
                    platform_message_id: message.id,
                    text: message.text.clone(),
                    platform_ts: message.sent_at,
                    received_at: clock::now_utc(),
                    is_recovered: true,
                    released_from_quarantine: false,
                };
                match self.ingress.ingest_entry(entry).await? {
                    IngestOutcome::Appended | IngestOutcome::Quarantined => ingested += 1,
                    IngestOutcome::DroppedDuplicate | IngestOutcome::TypingNoted => {},
                }
            }
        }
        Ok(ingested)
    }

    async fn platform_call<T>(
        &self,
        fut: impl Future<Output = maren_core::platform::PlatformResult<T>>,
    ) -> PipelineResult<T> {
        match tokio::time::timeout(self.resources.platform_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(PipelineError::Fatal("platform call timed out".to_owned())),
        }
    }

    async fn note_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_errors = 0;
    }

    /// Record a platform failure. Returns `true` when the breaker trips.
    async fn note_failure(&self) -> bool {
        let config = &self.resources.config.recovery;
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_errors += 1;
        if breaker.consecutive_errors >= config.breaker_threshold {
            breaker.open_until =
                Some(Instant::now() + Duration::from_secs(config.breaker_cooldown_seconds));
            breaker.consecutive_errors = 0;
            warn!(
                cooldown_secs = config.breaker_cooldown_seconds,
                "recovery circuit breaker tripped"
            );
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for RecoveryAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryAgent")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_bucket_burst_then_throttle() {
        let mut bucket = TokenBucket::new(1000, 3);
        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        // Burst drains instantly.
        assert!(start.elapsed() < Duration::from_millis(50));
        bucket.acquire().await;
        // The fourth token needs a refill interval.
        assert!(start.elapsed() >= Duration::from_millis(1));
    }
}
