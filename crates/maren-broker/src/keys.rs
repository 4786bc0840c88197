//! Key layout.
//!
//! One module owns every key format so the layout stays greppable:
//!
//! | Key | Shape | Contents |
//! |-----|-------|----------|
//! | `intake` | list | [`maren_core::IntakeEntry`] FIFO |
//! | `processing:{worker}` | list | entries popped by a drain worker, pending buffer placement |
//! | `buffer:{user}` | list (TTL) | per-user debounce buffer |
//! | `review_queue` | sorted set | pending interaction ids scored by priority |
//! | `approved` | list | approved outbound jobs, FIFO |
//! | `protocol:{user}` | string (TTL 5 min) | cached quarantine state, `"active"`/`"inactive"` |
//! | `typing:{user}` | string (TTL = typing window) | presence of the key is the flag |
//! | `handle:{user}` | string | cached outbound-addressable handle |
//! | `lock:user:{user}` | lock (TTL 5 min) | per-user supervisor serialization |
//! | `quota:{model}:{yyyymmdd}` | counter (TTL 48 h) | requests served today |
//! | `ratelimit:{ip}:{minute}` | counter (TTL 2 min) | reviewer API per-IP budget |

use maren_core::UserId;

/// The durable intake FIFO.
pub const INTAKE: &str = "intake";

/// Debounced processing units awaiting a supervisor worker.
pub const UNITS: &str = "units";

/// The score-sorted review queue.
pub const REVIEW_QUEUE: &str = "review_queue";

/// The approved-outbound FIFO.
pub const APPROVED: &str = "approved";

/// The dead-letter list for units that exhausted their retries.
pub const DEAD_LETTER: &str = "dead_letter";

/// Prefix of all per-worker processing lists, for janitor scans.
pub const PROCESSING_PREFIX: &str = "processing:";

/// Per-worker processing list.
#[must_use]
pub fn processing(worker_id: &str) -> String {
    format!("{PROCESSING_PREFIX}{worker_id}")
}

/// Per-user debounce buffer.
#[must_use]
pub fn buffer(user_id: UserId) -> String {
    format!("buffer:{user_id}")
}

/// Cached per-user protocol state.
#[must_use]
pub fn protocol(user_id: UserId) -> String {
    format!("protocol:{user_id}")
}

/// Per-user typing flag.
#[must_use]
pub fn typing(user_id: UserId) -> String {
    format!("typing:{user_id}")
}

/// Cached outbound handle.
#[must_use]
pub fn handle(user_id: UserId) -> String {
    format!("handle:{user_id}")
}

/// Per-user supervisor lock.
#[must_use]
pub fn user_lock(user_id: UserId) -> String {
    format!("lock:user:{user_id}")
}

/// Day-scoped quota counter for a model. `day` is `yyyymmdd` in UTC.
#[must_use]
pub fn quota(model: &str, day: &str) -> String {
    format!("quota:{model}:{day}")
}

/// Per-IP, per-minute reviewer API budget.
#[must_use]
pub fn rate_limit(ip: &str, minute_bucket: i64) -> String {
    format!("ratelimit:{ip}:{minute_bucket}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(processing("w1"), "processing:w1");
        assert_eq!(buffer(UserId(42)), "buffer:42");
        assert_eq!(quota("claude", "20250601"), "quota:claude:20250601");
        assert!(processing("w1").starts_with(PROCESSING_PREFIX));
    }
}
