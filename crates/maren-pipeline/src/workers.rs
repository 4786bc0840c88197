//! The long-running worker pool.
//!
//! Four worker roles plus support tasks, all cancelled through one
//! [`CancellationToken`]:
//!
//! 1. Intake drain workers: blocking-move entries from `intake` into their
//!    own `processing:{id}` list, hand them to the tracker, then clear the
//!    processing entry.
//! 2. Supervisor workers: consume released units, strictly serialized per
//!    user through the broker's TTL'd user locks.
//! 3. Dispatch workers: consume the approved list; surge workers join in
//!    while the list is above its watermark.
//! 4. The recovery worker runs once at startup (and on API trigger).
//!
//! Plus: the tracker's scheduler tick, the protocol-event listener, and the
//! janitor.

use std::sync::Arc;
use std::time::Duration;

use maren_broker::{BrokerEvent, keys};
use maren_core::{DispatchJob, IntakeEntry, ProcessingUnit, RecoveryTrigger, clock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::ingress::IngressAdapter;
use crate::protocol::ProtocolManager;
use crate::recovery::RecoveryAgent;
use crate::resources::Resources;
use crate::supervisor::{Supervisor, SupervisorOutcome};
use crate::tracker::ActivityTracker;

/// Blocking-pop timeout; bounds how long cancellation can lag.
const POP_TIMEOUT: Duration = Duration::from_secs(1);
/// Tracker tick interval.
const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// Janitor interval.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Supervisor user locks carry this safety TTL.
const USER_LOCK_TTL: Duration = Duration::from_secs(5 * 60);
/// Pause after a requeue (quota exhaustion) before pulling the next unit.
const REQUEUE_PAUSE: Duration = Duration::from_secs(5);
/// Surge dispatch workers added while the approved list is hot.
const SURGE_DISPATCHERS: usize = 2;

/// Everything the worker pool drives.
pub struct PipelineHandles {
    /// Shared resources.
    pub resources: Resources,
    /// Protocol manager.
    pub protocol: Arc<ProtocolManager>,
    /// Ingress adapter.
    pub ingress: Arc<IngressAdapter>,
    /// Activity tracker.
    pub tracker: Arc<ActivityTracker>,
    /// Supervisor.
    pub supervisor: Arc<Supervisor>,
    /// Dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// Recovery agent.
    pub recovery: Arc<RecoveryAgent>,
}

impl PipelineHandles {
    /// Wire up every component over one resource record.
    #[must_use]
    pub fn build(resources: Resources) -> Self {
        let protocol = Arc::new(ProtocolManager::new(resources.clone()));
        let ingress = Arc::new(IngressAdapter::new(resources.clone(), Arc::clone(&protocol)));
        let tracker = Arc::new(ActivityTracker::new(resources.clone()));
        let supervisor = Arc::new(Supervisor::new(resources.clone(), Arc::clone(&protocol)));
        let dispatcher = Arc::new(Dispatcher::new(resources.clone(), Arc::clone(&protocol)));
        let recovery = Arc::new(RecoveryAgent::new(resources.clone(), Arc::clone(&ingress)));
        Self {
            resources,
            protocol,
            ingress,
            tracker,
            supervisor,
            dispatcher,
            recovery,
        }
    }

    /// Reseed broker state from the store after a restart: unprocessed
    /// intake rows back onto the intake list, pending interactions back
    /// onto the review queue, approved-but-undelivered back onto the
    /// approved list.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::PipelineError`] on store or broker failure.
    pub async fn reseed_from_store(&self) -> crate::PipelineResult<()> {
        let resources = &self.resources;

        let rows = resources.store.unprocessed_intake().await?;
        let intake_count = rows.len();
        for row in rows {
            resources.broker.push_back(keys::INTAKE, &row.entry)?;
        }

        let pending = resources.store.list_pending(i64::MAX).await?;
        let pending_count = pending.len();
        let review = &resources.config.review;
        let now = clock::now_utc();
        for row in pending {
            let age_minutes = (now - row.interaction.received_at).num_seconds() as f64 / 60.0;
            let priority = maren_core::review_priority(
                age_minutes,
                row.user_value,
                row.interaction.safety.risk_score,
                (review.age_weight, review.value_weight, review.risk_weight),
            );
            #[allow(clippy::cast_sign_loss)]
            resources.broker.zadd(
                keys::REVIEW_QUEUE,
                &row.interaction.id.to_string(),
                priority,
                row.sequence as u64,
            );
        }

        let approved = resources.store.approved_undispatched().await?;
        let approved_count = approved.len();
        for interaction in approved {
            let Some(bubbles) = interaction.final_bubbles.clone() else {
                continue;
            };
            resources.broker.push_back(
                keys::APPROVED,
                &DispatchJob {
                    interaction_id: interaction.id,
                    user_id: interaction.user_id,
                    bubbles,
                },
            )?;
        }

        info!(
            intake = intake_count,
            pending = pending_count,
            approved = approved_count,
            "broker reseeded from store"
        );
        Ok(())
    }

    /// Spawn every worker. Returned handles join after `cancel` fires.
    #[must_use]
    pub fn spawn_workers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let workers = &self.resources.config.workers;

        for worker_index in 0..workers.intake {
            handles.push(spawn_intake_drain(
                self.resources.clone(),
                Arc::clone(&self.tracker),
                worker_index,
                cancel.clone(),
            ));
        }

        handles.push(spawn_tracker_tick(
            Arc::clone(&self.tracker),
            cancel.clone(),
        ));
        handles.push(spawn_protocol_listener(
            self.resources.clone(),
            Arc::clone(&self.tracker),
            cancel.clone(),
        ));

        for worker_index in 0..workers.supervisor {
            handles.push(spawn_supervisor(
                self.resources.clone(),
                Arc::clone(&self.supervisor),
                worker_index,
                cancel.clone(),
            ));
        }

        for worker_index in 0..workers.dispatch {
            handles.push(spawn_dispatch(
                self.resources.clone(),
                Arc::clone(&self.dispatcher),
                worker_index,
                false,
                cancel.clone(),
            ));
        }
        for worker_index in 0..SURGE_DISPATCHERS {
            handles.push(spawn_dispatch(
                self.resources.clone(),
                Arc::clone(&self.dispatcher),
                workers.dispatch + worker_index,
                true,
                cancel.clone(),
            ));
        }

        handles.push(spawn_janitor(self.resources.clone(), cancel.clone()));
        handles
    }

    /// Kick off the startup recovery pass in the background.
    pub fn spawn_startup_recovery(&self) -> JoinHandle<()> {
        let recovery = Arc::clone(&self.recovery);
        tokio::spawn(async move {
            match recovery.run(RecoveryTrigger::Startup).await {
                Ok(op) => info!(op_id = %op.id, "startup recovery finished"),
                Err(err) => warn!(%err, "startup recovery failed"),
            }
        })
    }
}

fn spawn_intake_drain(
    resources: Resources,
    tracker: Arc<ActivityTracker>,
    index: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let worker_id = format!("intake-{index}");
        let processing_key = keys::processing(&worker_id);
        info!(worker = worker_id, "intake drain worker up");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                moved = resources.broker.move_blocking::<IntakeEntry>(
                    keys::INTAKE,
                    &processing_key,
                    POP_TIMEOUT,
                ) => {
                    match moved {
                        Ok(Some(entry)) => {
                            if let Err(err) = tracker.accept(entry) {
                                error!(worker = worker_id, %err, "buffer placement failed");
                                continue;
                            }
                            // Placed: the processing copy has done its job.
                            let _ = resources
                                .broker
                                .pop_front::<IntakeEntry>(&processing_key);
                        },
                        Ok(None) => {},
                        Err(err) => {
                            error!(worker = worker_id, %err, "corrupt intake entry dropped");
                            let _ = resources
                                .broker
                                .pop_front::<serde_json::Value>(&processing_key);
                        },
                    }
                },
            }
        }
        info!(worker = worker_id, "intake drain worker down");
    })
}

fn spawn_tracker_tick(tracker: Arc<ActivityTracker>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = tracker.tick() {
                        error!(%err, "tracker tick failed");
                    }
                },
            }
        }
    })
}

/// Protocol activations drain the user's pending buffer into quarantine.
fn spawn_protocol_listener(
    resources: Resources,
    tracker: Arc<ActivityTracker>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut receiver = resources.broker.subscribe();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = receiver.recv() => {
                    match event {
                        Some(BrokerEvent::ProtocolChanged { user_id, active: true }) => {
                            if let Err(err) = tracker.drain_to_quarantine(user_id).await {
                                error!(%user_id, %err, "buffer quarantine drain failed");
                            }
                        },
                        Some(_) => {},
                        None => break,
                    }
                },
            }
        }
    })
}

fn spawn_supervisor(
    resources: Resources,
    supervisor: Arc<Supervisor>,
    index: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let worker_id = format!("supervisor-{index}");
        info!(worker = worker_id, "supervisor worker up");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                popped = resources.broker.pop_blocking::<ProcessingUnit>(keys::UNITS, POP_TIMEOUT) => {
                    let unit = match popped {
                        Ok(Some(unit)) => unit,
                        Ok(None) => continue,
                        Err(err) => {
                            error!(worker = worker_id, %err, "corrupt unit dropped");
                            continue;
                        },
                    };
                    run_unit(&resources, &supervisor, &worker_id, unit).await;
                },
            }
        }
        info!(worker = worker_id, "supervisor worker down");
    })
}

/// Process one unit under the per-user lock, with retry/dead-letter
/// bookkeeping.
async fn run_unit(
    resources: &Resources,
    supervisor: &Supervisor,
    worker_id: &str,
    unit: ProcessingUnit,
) {
    let lock_key = keys::user_lock(unit.user_id);
    let Some(lock) = resources.broker.try_acquire_lock(&lock_key, USER_LOCK_TTL) else {
        // Another worker is mid-unit for this user. Back to the head of the
        // queue so per-user order survives the retry.
        let _ = resources.broker.push_front(keys::UNITS, &unit);
        tokio::time::sleep(Duration::from_millis(100)).await;
        return;
    };

    let outcome = supervisor.process_unit(unit.clone()).await;
    resources.broker.release_lock(&lock);

    match outcome {
        Ok(SupervisorOutcome::Requeued) => {
            tokio::time::sleep(REQUEUE_PAUSE).await;
        },
        Ok(_) => {},
        Err(err) => {
            let mut failed = unit;
            failed.attempts = failed.attempts.saturating_add(1);
            let retry_max = resources.config.workers.retry_max;
            if failed.attempts >= retry_max {
                error!(
                    worker = worker_id,
                    user_id = %failed.user_id,
                    attempts = failed.attempts,
                    %err,
                    "unit dead-lettered"
                );
                let payload = serde_json::json!({
                    "unit": failed,
                    "error": err.to_string(),
                });
                let _ = resources.broker.push_back(keys::DEAD_LETTER, &payload);
            } else {
                warn!(
                    worker = worker_id,
                    user_id = %failed.user_id,
                    attempts = failed.attempts,
                    %err,
                    "unit failed, will retry"
                );
                let _ = resources.broker.push_back(keys::UNITS, &failed);
            }
        },
    }
}

fn spawn_dispatch(
    resources: Resources,
    dispatcher: Arc<Dispatcher>,
    index: usize,
    surge_only: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let worker_id = format!("dispatch-{index}");
        info!(worker = worker_id, surge_only, "dispatch worker up");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            // Surge workers only pull while the approved list is hot.
            if surge_only
                && resources.broker.list_len(keys::APPROVED)
                    <= resources.config.queues.approved_high_watermark
            {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                popped = resources.broker.pop_blocking::<DispatchJob>(keys::APPROVED, POP_TIMEOUT) => {
                    match popped {
                        Ok(Some(job)) => {
                            if let Err(err) = dispatcher.dispatch(&job).await {
                                error!(worker = worker_id, %err, "dispatch error");
                            }
                        },
                        Ok(None) => {},
                        Err(err) => error!(worker = worker_id, %err, "corrupt dispatch job dropped"),
                    }
                },
            }
        }
        info!(worker = worker_id, "dispatch worker down");
    })
}

fn spawn_janitor(resources: Resources, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = crate::janitor::sweep(&resources).await {
                        error!(%err, "janitor sweep failed");
                    }
                },
            }
        }
    })
}
