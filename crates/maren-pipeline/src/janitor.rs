//! Janitor: periodic maintenance.
//!
//! - Re-injects entries stuck in `processing:*` lists (a drain worker died
//!   between popping and buffering) at the head of intake; the supervisor's
//!   idempotence check absorbs any duplicates this introduces.
//! - Sweeps expired broker slots.
//! - Expires due commitments, reaps purged quarantine entries past their
//!   retention, and prunes inactive conversation memory.

use chrono::Duration as ChronoDuration;
use maren_broker::keys;
use maren_core::{IntakeEntry, clock};
use tracing::{info, warn};

use crate::error::PipelineResult;
use crate::resources::Resources;

/// A processing list idle this long is presumed orphaned.
const STALE_PROCESSING: std::time::Duration = std::time::Duration::from_secs(2 * 60);

/// Purged quarantine entries are kept this long.
const QUARANTINE_RETENTION_DAYS: i64 = 30;

/// One maintenance sweep. The worker pool runs this on an interval.
///
/// # Errors
///
/// Returns a [`crate::PipelineError`] on store or broker failure.
pub async fn sweep(resources: &Resources) -> PipelineResult<()> {
    reinject_stale_processing(resources)?;

    let reaped = resources.broker.sweep_expired();
    if reaped > 0 {
        info!(reaped, "swept expired broker slots");
    }

    let now = clock::now_utc();
    let expired = resources.store.expire_due_commitments(now).await?;
    if expired > 0 {
        info!(expired, "expired due commitments");
    }

    let purged = resources
        .store
        .reap_purged_quarantine(now - ChronoDuration::days(QUARANTINE_RETENTION_DAYS))
        .await?;
    if purged > 0 {
        info!(purged, "reaped purged quarantine entries");
    }

    let pruned = resources.memory.prune_inactive(now).await?;
    if pruned > 0 {
        info!(pruned, "pruned inactive memory");
    }
    Ok(())
}

/// Move entries from orphaned processing lists back to the head of intake,
/// preserving their order.
fn reinject_stale_processing(resources: &Resources) -> PipelineResult<()> {
    for key in resources.broker.list_keys(keys::PROCESSING_PREFIX) {
        let idle = resources.broker.list_idle_for(&key);
        let len = resources.broker.list_len(&key);
        if len == 0 || idle.is_none_or(|idle| idle < STALE_PROCESSING) {
            continue;
        }
        let entries: Vec<IntakeEntry> = resources.broker.drain_list(&key)?;
        warn!(key, count = entries.len(), "re-injecting orphaned processing entries");
        for entry in entries.into_iter().rev() {
            resources.broker.push_front(keys::INTAKE, &entry)?;
        }
        resources.broker.delete_list(&key);
    }
    Ok(())
}
