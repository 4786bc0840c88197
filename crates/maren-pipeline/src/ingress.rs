//! Ingress adapter: platform events into the pipeline.

use std::sync::Arc;
use std::time::Duration;

use maren_broker::{BrokerEvent, keys};
use maren_core::{IntakeEntry, PlatformEvent, PlatformMessage, UserId, clock};
use maren_store::StoreError;
use tracing::{debug, warn};

use crate::error::PipelineResult;
use crate::protocol::{ProtocolManager, RouteDecision};
use crate::resources::Resources;

/// Backpressure delay applied above the intake high watermark.
const BACKPRESSURE_DELAY: Duration = Duration::from_millis(250);

/// What happened to an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Appended to the intake log.
    Appended,
    /// Parked in quarantine.
    Quarantined,
    /// Idempotently dropped: the message id was already ingested.
    DroppedDuplicate,
    /// Typing flag updated; nothing persisted.
    TypingNoted,
}

/// Receives platform events, applies the protocol gate, and writes to the
/// intake log.
pub struct IngressAdapter {
    resources: Resources,
    protocol: Arc<ProtocolManager>,
}

impl IngressAdapter {
    /// Create an adapter over the shared resources.
    #[must_use]
    pub fn new(resources: Resources, protocol: Arc<ProtocolManager>) -> Self {
        Self {
            resources,
            protocol,
        }
    }

    /// Handle one platform event.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure. Transport-level
    /// failures never reach here; the transport retries them upstream.
    pub async fn handle_event(&self, event: PlatformEvent) -> PipelineResult<IngestOutcome> {
        match event {
            PlatformEvent::Message(message) => self.handle_message(message).await,
            PlatformEvent::Typing { user_id, active } => {
                if active {
                    self.resources.broker.set_string(
                        &keys::typing(user_id),
                        "1",
                        Some(self.resources.typing_window()),
                    );
                } else {
                    self.resources.broker.delete_string(&keys::typing(user_id));
                }
                Ok(IngestOutcome::TypingNoted)
            },
        }
    }

    async fn handle_message(&self, message: PlatformMessage) -> PipelineResult<IngestOutcome> {
        let now = clock::now_utc();

        // Resolve-or-create the user row and warm the outbound handle so the
        // persona can still reply if the platform later refuses resolution.
        self.warm_user(message.user_id).await?;

        let entry = IntakeEntry {
            user_id: message.user_id,
            platform_message_id: message.id,
            text: message.text,
            platform_ts: message.sent_at,
            received_at: now,
            is_recovered: false,
            released_from_quarantine: false,
        };
        self.ingest_entry(entry).await
    }

    /// Shared ingest path for live messages and recovery re-ingestion.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store failure.
    pub async fn ingest_entry(&self, entry: IntakeEntry) -> PipelineResult<IngestOutcome> {
        match self.protocol.route(entry.user_id).await? {
            RouteDecision::Quarantine => {
                match self
                    .resources
                    .store
                    .insert_quarantine(
                        entry.user_id,
                        entry.platform_message_id,
                        &entry.text,
                        entry.received_at,
                    )
                    .await
                {
                    Ok(_) => Ok(IngestOutcome::Quarantined),
                    Err(StoreError::Duplicate(_)) => self.drop_duplicate(&entry),
                    Err(err) => Err(err.into()),
                }
            },
            RouteDecision::Process => {
                match self.resources.store.append_intake(&entry).await {
                    Ok(()) => {},
                    Err(StoreError::Duplicate(_)) => return self.drop_duplicate(&entry),
                    Err(err) => return Err(err.into()),
                }
                let depth = self.resources.broker.push_back(keys::INTAKE, &entry)?;
                debug!(
                    user_id = %entry.user_id,
                    message_id = %entry.platform_message_id,
                    depth,
                    "intake append"
                );
                self.apply_backpressure(depth).await;
                Ok(IngestOutcome::Appended)
            },
        }
    }

    fn drop_duplicate(&self, entry: &IntakeEntry) -> PipelineResult<IngestOutcome> {
        self.resources.broker.incr("metrics:duplicate_ingest", None);
        debug!(
            user_id = %entry.user_id,
            message_id = %entry.platform_message_id,
            "duplicate ingest dropped"
        );
        Ok(IngestOutcome::DroppedDuplicate)
    }

    async fn warm_user(&self, user_id: UserId) -> PipelineResult<()> {
        // Handle warming is best-effort: a transport hiccup must not lose
        // the message.
        let nickname = match tokio::time::timeout(
            self.resources.platform_timeout(),
            self.resources.platform.resolve_user(user_id),
        )
        .await
        {
            Ok(Ok(profile)) => {
                self.resources
                    .broker
                    .set_string(&keys::handle(user_id), &user_id.to_string(), None);
                profile.display_name
            },
            Ok(Err(err)) => {
                warn!(%user_id, %err, "outbound handle warm failed");
                None
            },
            Err(_) => {
                warn!(%user_id, "outbound handle warm timed out");
                None
            },
        };
        self.resources
            .store
            .upsert_user_on_contact(user_id, nickname.as_deref(), clock::now_utc())
            .await?;
        Ok(())
    }

    async fn apply_backpressure(&self, depth: usize) {
        let watermark = self.resources.config.queues.intake_high_watermark;
        if depth > watermark {
            warn!(depth, watermark, "intake above high watermark");
            self.resources
                .broker
                .publish(BrokerEvent::IntakeBackpressure { depth });
            tokio::time::sleep(BACKPRESSURE_DELAY).await;
        }
    }
}

impl std::fmt::Debug for IngressAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressAdapter").finish_non_exhaustive()
    }
}
