//! Dispatcher: approved bubbles out to the platform, humanly paced.

use std::sync::Arc;
use std::time::Duration;

use maren_broker::keys;
use maren_core::{DispatchJob, DispatchState, UserId, clock};
use tracing::{error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::protocol::{ProtocolManager, RouteDecision};
use crate::resources::Resources;

/// Handle-resolution retry delays.
const RESOLVE_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
];

/// Outcome of one dispatch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// All bubbles delivered.
    Sent,
    /// Outbound handle could not be resolved; interaction marked failed.
    Failed,
    /// Quarantine activated before or during delivery.
    CancelledQuarantine,
}

/// Consumes the approved list and delivers bubbles in order.
pub struct Dispatcher {
    resources: Resources,
    protocol: Arc<ProtocolManager>,
}

impl Dispatcher {
    /// Create a dispatcher over the shared resources.
    #[must_use]
    pub fn new(resources: Resources, protocol: Arc<ProtocolManager>) -> Self {
        Self {
            resources,
            protocol,
        }
    }

    /// Deliver one approved job.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] on store failure. Transport failures are
    /// absorbed into the dispatch outcome.
    pub async fn dispatch(&self, job: &DispatchJob) -> PipelineResult<DispatchOutcome> {
        let user_id = job.user_id;

        if self.quarantined(user_id).await? {
            self.resources
                .store
                .set_dispatch_state(job.interaction_id, DispatchState::CancelledQuarantine)
                .await?;
            info!(%user_id, interaction_id = %job.interaction_id, "dispatch cancelled by quarantine");
            return Ok(DispatchOutcome::CancelledQuarantine);
        }

        if !self.resolve_handle(user_id).await {
            self.resources
                .store
                .set_dispatch_state(job.interaction_id, DispatchState::Failed)
                .await?;
            error!(
                %user_id,
                interaction_id = %job.interaction_id,
                "dispatch failed: outbound handle unresolvable"
            );
            return Ok(DispatchOutcome::Failed);
        }

        for (index, bubble) in job.bubbles.iter().enumerate() {
            // Quarantine can flip between bubbles.
            if self.quarantined(user_id).await? {
                self.resources
                    .store
                    .set_dispatch_state(job.interaction_id, DispatchState::CancelledQuarantine)
                    .await?;
                return Ok(DispatchOutcome::CancelledQuarantine);
            }

            let typing_secs = typing_duration(bubble);
            let _ = self.resources.platform.send_typing(user_id).await;
            tokio::time::sleep(typing_secs).await;

            if let Err(err) = self.send_with_retry(user_id, bubble).await {
                warn!(%user_id, bubble = index, %err, "bubble send failed");
                self.resources
                    .store
                    .set_dispatch_state(job.interaction_id, DispatchState::Failed)
                    .await?;
                return Ok(DispatchOutcome::Failed);
            }

            if index + 1 < job.bubbles.len() {
                tokio::time::sleep(inter_bubble_pause(bubble)).await;
            }
        }

        // Memory reflects what the user actually received.
        let now = clock::now_utc();
        for bubble in &job.bubbles {
            self.resources
                .memory
                .append(user_id, maren_memory::MemoryRole::Assistant, bubble, now)
                .await?;
        }
        self.resources
            .store
            .set_dispatch_state(job.interaction_id, DispatchState::Sent)
            .await?;
        info!(
            %user_id,
            interaction_id = %job.interaction_id,
            bubbles = job.bubbles.len(),
            "dispatched"
        );
        Ok(DispatchOutcome::Sent)
    }

    async fn quarantined(&self, user_id: UserId) -> PipelineResult<bool> {
        Ok(self.protocol.route(user_id).await? == RouteDecision::Quarantine)
    }

    /// The handle should already be warm from ingress; fall back to a
    /// platform lookup with 1 s / 5 s / 30 s backoff.
    async fn resolve_handle(&self, user_id: UserId) -> bool {
        if self
            .resources
            .broker
            .get_string(&keys::handle(user_id))
            .is_some()
        {
            return true;
        }
        for (attempt, delay) in RESOLVE_BACKOFF.iter().enumerate() {
            match tokio::time::timeout(
                self.resources.platform_timeout(),
                self.resources.platform.resolve_user(user_id),
            )
            .await
            {
                Ok(Ok(_)) => {
                    self.resources.broker.set_string(
                        &keys::handle(user_id),
                        &user_id.to_string(),
                        None,
                    );
                    return true;
                },
                Ok(Err(err)) => {
                    warn!(%user_id, attempt, %err, "handle resolution failed");
                },
                Err(_) => warn!(%user_id, attempt, "handle resolution timed out"),
            }
            tokio::time::sleep(*delay).await;
        }
        false
    }

    async fn send_with_retry(&self, user_id: UserId, bubble: &str) -> PipelineResult<()> {
        let retry_max = self.resources.config.workers.retry_max.max(1);
        let mut delay = Duration::from_millis(500);
        let mut last_err = None;
        for _ in 0..retry_max {
            match tokio::time::timeout(
                self.resources.platform_timeout(),
                self.resources.platform.send_message(user_id, bubble),
            )
            .await
            {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => last_err = Some(PipelineError::from(err)),
                Err(_) => {
                    last_err = Some(PipelineError::Fatal("platform send timed out".to_owned()));
                },
            }
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
        Err(last_err.unwrap_or_else(|| PipelineError::Fatal("send failed".to_owned())))
    }
}

/// Typing-indicator duration: proportional to length, clamped to a human
/// range.
fn typing_duration(bubble: &str) -> Duration {
    #[allow(clippy::cast_precision_loss)]
    let secs = (bubble.chars().count() as f64 / 40.0).clamp(0.0, 6.0).max(1.2);
    Duration::from_secs_f64(secs)
}

/// Pause between consecutive bubbles.
fn inter_bubble_pause(bubble: &str) -> Duration {
    #[allow(clippy::cast_precision_loss)]
    let secs = (bubble.chars().count() as f64 / 80.0).min(1.5);
    Duration::from_secs_f64(secs)
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_duration_bounds() {
        assert!((typing_duration("hi").as_secs_f64() - 1.2).abs() < 1e-9);
        let long = "x".repeat(1000);
        assert!((typing_duration(&long).as_secs_f64() - 6.0).abs() < 1e-9);
        // 120 chars -> 3 seconds.
        let mid = "x".repeat(120);
        assert!((typing_duration(&mid).as_secs_f64() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_inter_bubble_pause_caps() {
        assert!(inter_bubble_pause("short").as_secs_f64() < 0.1);
        let long = "x".repeat(1000);
        assert!((inter_bubble_pause(&long).as_secs_f64() - 1.5).abs() < 1e-9);
    }
}
