//! The broker itself.
//!
//! Sharded maps guard each keyspace; no method ever holds two shard guards
//! at once. Expiry is lazy on access plus a periodic [`Broker::sweep_expired`]
//! pass driven by the janitor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, broadcast};
use tracing::trace;

use crate::error::{BrokerError, BrokerResult};
use crate::events::{BrokerEvent, CHANNEL_CAPACITY, EventReceiver};

struct ListSlot {
    items: VecDeque<String>,
    expires_at: Option<Instant>,
    touched_at: Instant,
}

impl ListSlot {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            expires_at: None,
            touched_at: Instant::now(),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct StringSlot {
    value: String,
    expires_at: Option<Instant>,
}

struct CounterSlot {
    value: i64,
    expires_at: Option<Instant>,
}

struct LockSlot {
    token: String,
    expires_at: Instant,
}

/// A member of a sorted set with its score and insertion sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    /// The member payload.
    pub member: String,
    /// Sort score; higher sorts first.
    pub score: f64,
    /// Insertion sequence; lower sorts first within equal scores.
    pub sequence: u64,
}

/// A held per-key lock. Dropping the token does NOT release the lock;
/// holders release explicitly (or let the TTL reap it after a crash).
#[derive(Debug, Clone)]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// The in-process queue broker. Cheap to share behind an [`Arc`].
pub struct Broker {
    lists: DashMap<String, ListSlot>,
    strings: DashMap<String, StringSlot>,
    counters: DashMap<String, CounterSlot>,
    zsets: DashMap<String, HashMap<String, (f64, u64)>>,
    locks: DashMap<String, LockSlot>,
    notifiers: DashMap<String, Arc<Notify>>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            lists: DashMap::new(),
            strings: DashMap::new(),
            counters: DashMap::new(),
            zsets: DashMap::new(),
            locks: DashMap::new(),
            notifiers: DashMap::new(),
            events,
        }
    }

    fn notifier(&self, key: &str) -> Arc<Notify> {
        self.notifiers
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn encode<T: Serialize>(key: &str, item: &T) -> BrokerResult<String> {
        serde_json::to_string(item).map_err(|source| BrokerError::Codec {
            key: key.to_owned(),
            source,
        })
    }

    fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> BrokerResult<T> {
        serde_json::from_str(raw).map_err(|source| BrokerError::Codec {
            key: key.to_owned(),
            source,
        })
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    /// Append to the tail of a list. Returns the new length.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Codec`] if the item cannot be serialized.
    pub fn push_back<T: Serialize>(&self, key: &str, item: &T) -> BrokerResult<usize> {
        let raw = Self::encode(key, item)?;
        let len = {
            let mut slot = self
                .lists
                .entry(key.to_owned())
                .or_insert_with(ListSlot::new);
            let now = Instant::now();
            if slot.expired(now) {
                slot.items.clear();
                slot.expires_at = None;
            }
            slot.items.push_back(raw);
            slot.touched_at = now;
            slot.items.len()
        };
        self.notifier(key).notify_one();
        trace!(key, len, "list push_back");
        Ok(len)
    }

    /// Prepend to the head of a list (janitor re-injection). Returns the
    /// new length.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Codec`] if the item cannot be serialized.
    pub fn push_front<T: Serialize>(&self, key: &str, item: &T) -> BrokerResult<usize> {
        let raw = Self::encode(key, item)?;
        let len = {
            let mut slot = self
                .lists
                .entry(key.to_owned())
                .or_insert_with(ListSlot::new);
            let now = Instant::now();
            if slot.expired(now) {
                slot.items.clear();
                slot.expires_at = None;
            }
            slot.items.push_front(raw);
            slot.touched_at = now;
            slot.items.len()
        };
        self.notifier(key).notify_one();
        Ok(len)
    }

    fn pop_front_raw(&self, key: &str) -> Option<String> {
        let mut slot = self.lists.get_mut(key)?;
        let now = Instant::now();
        if slot.expired(now) {
            slot.items.clear();
            slot.expires_at = None;
            return None;
        }
        let raw = slot.items.pop_front();
        if raw.is_some() {
            slot.touched_at = now;
        }
        raw
    }

    /// Pop from the head of a list without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Codec`] if the stored payload is corrupt.
    pub fn pop_front<T: DeserializeOwned>(&self, key: &str) -> BrokerResult<Option<T>> {
        match self.pop_front_raw(key) {
            Some(raw) => Ok(Some(Self::decode(key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Block until an item can be popped from the head of `key`, or until
    /// `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Codec`] if the stored payload is corrupt.
    pub async fn pop_blocking<T: DeserializeOwned>(
        &self,
        key: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.notifier(key);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(raw) = self.pop_front_raw(key) {
                return Ok(Some(Self::decode(key, &raw)?));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Atomically move the head of `src` to the tail of `dst`, blocking up
    /// to `timeout` for an item to appear. The cooperative two-step drain
    /// protocol: a consumer moves an entry into its own `processing:*` list
    /// before acting on it, and the janitor re-injects stale lists.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Codec`] if the stored payload is corrupt.
    pub async fn move_blocking<T: DeserializeOwned>(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> BrokerResult<Option<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.notifier(src);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(raw) = self.pop_front_raw(src) {
                {
                    let mut slot = self
                        .lists
                        .entry(dst.to_owned())
                        .or_insert_with(ListSlot::new);
                    slot.items.push_back(raw.clone());
                    slot.touched_at = Instant::now();
                }
                self.notifier(dst).notify_one();
                return Ok(Some(Self::decode(src, &raw)?));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Current list length (0 for missing or expired lists).
    #[must_use]
    pub fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, |slot| {
            if slot.expired(Instant::now()) {
                0
            } else {
                slot.items.len()
            }
        })
    }

    /// Snapshot a list without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Codec`] if a stored payload is corrupt.
    pub fn list_items<T: DeserializeOwned>(&self, key: &str) -> BrokerResult<Vec<T>> {
        let Some(slot) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        if slot.expired(Instant::now()) {
            return Ok(Vec::new());
        }
        slot.items
            .iter()
            .map(|raw| Self::decode(key, raw))
            .collect()
    }

    /// Remove and return every item of a list, head first.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Codec`] if a stored payload is corrupt.
    pub fn drain_list<T: DeserializeOwned>(&self, key: &str) -> BrokerResult<Vec<T>> {
        let Some(mut slot) = self.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let expired = slot.expired(Instant::now());
        let raws: Vec<String> = slot.items.drain(..).collect();
        slot.expires_at = None;
        slot.touched_at = Instant::now();
        drop(slot);
        if expired {
            return Ok(Vec::new());
        }
        raws.iter().map(|raw| Self::decode(key, raw)).collect()
    }

    /// Delete a list outright.
    pub fn delete_list(&self, key: &str) {
        self.lists.remove(key);
    }

    /// Set (or clear) a TTL on a list. Missing lists are created empty so a
    /// TTL can be armed before the first push.
    pub fn set_list_ttl(&self, key: &str, ttl: Option<Duration>) {
        let mut slot = self
            .lists
            .entry(key.to_owned())
            .or_insert_with(ListSlot::new);
        slot.expires_at = ttl.map(|ttl| Instant::now() + ttl);
    }

    /// How long a list has been idle (no push or pop). `None` for missing
    /// lists. Used by the janitor to find abandoned `processing:*` lists.
    #[must_use]
    pub fn list_idle_for(&self, key: &str) -> Option<Duration> {
        self.lists.get(key).map(|slot| slot.touched_at.elapsed())
    }

    /// All list keys starting with `prefix`.
    #[must_use]
    pub fn list_keys(&self, prefix: &str) -> Vec<String> {
        self.lists
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Set a cache string with an optional TTL.
    pub fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.strings.insert(
            key.to_owned(),
            StringSlot {
                value: value.to_owned(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Read a cache string; expired entries read as absent.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        let slot = self.strings.get(key)?;
        if slot.expires_at.is_some_and(|at| at <= Instant::now()) {
            return None;
        }
        Some(slot.value.clone())
    }

    /// Delete a cache string. Returns whether it existed.
    pub fn delete_string(&self, key: &str) -> bool {
        self.strings.remove(key).is_some()
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    /// Atomically increment a counter, arming `ttl` on first touch.
    /// Returns the post-increment value.
    pub fn incr(&self, key: &str, ttl: Option<Duration>) -> i64 {
        let mut slot = self.counters.entry(key.to_owned()).or_insert(CounterSlot {
            value: 0,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        });
        if slot.expires_at.is_some_and(|at| at <= Instant::now()) {
            slot.value = 0;
            slot.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        }
        slot.value = slot.value.saturating_add(1);
        slot.value
    }

    /// Read a counter; expired counters read as 0.
    #[must_use]
    pub fn counter(&self, key: &str) -> i64 {
        self.counters.get(key).map_or(0, |slot| {
            if slot.expires_at.is_some_and(|at| at <= Instant::now()) {
                0
            } else {
                slot.value
            }
        })
    }

    // ------------------------------------------------------------------
    // Sorted set
    // ------------------------------------------------------------------

    /// Insert or update a member with a score and insertion sequence.
    pub fn zadd(&self, key: &str, member: &str, score: f64, sequence: u64) {
        self.zsets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), (score, sequence));
    }

    /// Remove a member. Returns whether it was present.
    pub fn zrem(&self, key: &str, member: &str) -> bool {
        self.zsets
            .get_mut(key)
            .is_some_and(|mut set| set.remove(member).is_some())
    }

    /// Member count.
    #[must_use]
    pub fn zcard(&self, key: &str) -> usize {
        self.zsets.get(key).map_or(0, |set| set.len())
    }

    /// Members sorted by score descending, then sequence ascending,
    /// starting at `offset`, at most `limit`.
    #[must_use]
    pub fn zrange_desc(&self, key: &str, offset: usize, limit: usize) -> Vec<ScoredMember> {
        let Some(set) = self.zsets.get(key) else {
            return Vec::new();
        };
        let mut members: Vec<ScoredMember> = set
            .iter()
            .map(|(member, &(score, sequence))| ScoredMember {
                member: member.clone(),
                score,
                sequence,
            })
            .collect();
        drop(set);
        members.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.sequence.cmp(&b.sequence))
        });
        members.into_iter().skip(offset).take(limit).collect()
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Set-if-absent lock with a safety TTL. Returns a token on success,
    /// `None` while another holder's lock is live.
    #[must_use]
    pub fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = Instant::now();
        let token = uuid::Uuid::new_v4().to_string();
        let mut acquired = false;
        let mut slot = self.locks.entry(key.to_owned()).or_insert_with(|| {
            acquired = true;
            LockSlot {
                token: token.clone(),
                expires_at: now + ttl,
            }
        });
        if !acquired {
            if slot.expires_at > now {
                return None;
            }
            // Previous holder died; the TTL reaps the lock.
            slot.token.clone_from(&token);
            slot.expires_at = now + ttl;
        }
        drop(slot);
        Some(LockToken {
            key: key.to_owned(),
            token,
        })
    }

    /// Release a held lock. Returns `false` when the lock was already
    /// reaped and re-acquired by someone else.
    pub fn release_lock(&self, token: &LockToken) -> bool {
        match self.locks.get_mut(&token.key) {
            Some(slot) if slot.token == token.token => {
                drop(slot);
                self.locks.remove(&token.key);
                true
            },
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Pub/sub
    // ------------------------------------------------------------------

    /// Publish a coordination event to all subscribers. Returns the number
    /// of receivers.
    pub fn publish(&self, event: BrokerEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    /// Subscribe to coordination events.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.events.subscribe(),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop every expired list, string, counter, and lock. Returns how many
    /// slots were reaped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        let before = self.lists.len();
        self.lists.retain(|_, slot| !slot.expired(now));
        reaped += before - self.lists.len();

        let before = self.strings.len();
        self.strings
            .retain(|_, slot| !slot.expires_at.is_some_and(|at| at <= now));
        reaped += before - self.strings.len();

        let before = self.counters.len();
        self.counters
            .retain(|_, slot| !slot.expires_at.is_some_and(|at| at <= now));
        reaped += before - self.counters.len();

        let before = self.locks.len();
        self.locks.retain(|_, slot| slot.expires_at > now);
        reaped += before - self.locks.len();

        reaped
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("lists", &self.lists.len())
            .field("strings", &self.strings.len())
            .field("counters", &self.counters.len())
            .field("zsets", &self.zsets.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let broker = Broker::new();
        broker.push_back("q", &1).unwrap();
        broker.push_back("q", &2).unwrap();
        broker.push_back("q", &3).unwrap();
        assert_eq!(broker.pop_front::<i32>("q").unwrap(), Some(1));
        assert_eq!(broker.pop_front::<i32>("q").unwrap(), Some(2));
        broker.push_front("q", &0).unwrap();
        assert_eq!(broker.pop_front::<i32>("q").unwrap(), Some(0));
        assert_eq!(broker.pop_front::<i32>("q").unwrap(), Some(3));
        assert_eq!(broker.pop_front::<i32>("q").unwrap(), None);
    }

    #[tokio::test]
    async fn test_move_blocking_waits_for_producer() {
        let broker = Arc::new(Broker::new());
        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .move_blocking::<String>("src", "dst", Duration::from_secs(2))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push_back("src", &"hello".to_string()).unwrap();
        let moved = consumer.await.unwrap();
        assert_eq!(moved.as_deref(), Some("hello"));
        assert_eq!(broker.list_len("src"), 0);
        assert_eq!(broker.list_len("dst"), 1);
        let items: Vec<String> = broker.list_items("dst").unwrap();
        assert_eq!(items, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_pop_blocking_times_out() {
        let broker = Broker::new();
        let popped = broker
            .pop_blocking::<i32>("empty", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_string_ttl_expires() {
        let broker = Broker::new();
        broker.set_string("typing:1", "1", Some(Duration::from_millis(20)));
        assert_eq!(broker.get_string("typing:1").as_deref(), Some("1"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.get_string("typing:1"), None);
    }

    #[tokio::test]
    async fn test_list_ttl_expires() {
        let broker = Broker::new();
        broker.push_back("buffer:1", &"a".to_string()).unwrap();
        broker.set_list_ttl("buffer:1", Some(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.list_len("buffer:1"), 0);
        assert_eq!(broker.pop_front::<String>("buffer:1").unwrap(), None);
    }

    #[test]
    fn test_counter_increments_and_reads() {
        let broker = Broker::new();
        assert_eq!(broker.incr("quota:m:20250601", None), 1);
        assert_eq!(broker.incr("quota:m:20250601", None), 2);
        assert_eq!(broker.counter("quota:m:20250601"), 2);
        assert_eq!(broker.counter("quota:other:20250601"), 0);
    }

    #[test]
    fn test_zrange_orders_by_score_then_sequence() {
        let broker = Broker::new();
        broker.zadd("rq", "low", 0.2, 1);
        broker.zadd("rq", "high", 0.9, 2);
        broker.zadd("rq", "mid-b", 0.5, 4);
        broker.zadd("rq", "mid-a", 0.5, 3);
        let members: Vec<String> = broker
            .zrange_desc("rq", 0, 10)
            .into_iter()
            .map(|m| m.member)
            .collect();
        assert_eq!(members, vec!["high", "mid-a", "mid-b", "low"]);
        assert!(broker.zrem("rq", "high"));
        assert!(!broker.zrem("rq", "high"));
        assert_eq!(broker.zcard("rq"), 3);
    }

    #[test]
    fn test_lock_excludes_second_holder() {
        let broker = Broker::new();
        let token = broker
            .try_acquire_lock("lock:user:1", Duration::from_secs(300))
            .unwrap();
        assert!(
            broker
                .try_acquire_lock("lock:user:1", Duration::from_secs(300))
                .is_none()
        );
        assert!(broker.release_lock(&token));
        assert!(
            broker
                .try_acquire_lock("lock:user:1", Duration::from_secs(300))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_expired_lock_is_reacquirable() {
        let broker = Broker::new();
        let stale = broker
            .try_acquire_lock("lock:user:2", Duration::from_millis(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = broker.try_acquire_lock("lock:user:2", Duration::from_secs(60));
        assert!(fresh.is_some());
        // The stale holder can no longer release what it lost.
        assert!(!broker.release_lock(&stale));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = Broker::new();
        let mut receiver = broker.subscribe();
        let count = broker.publish(BrokerEvent::ProtocolChanged {
            user_id: maren_core::UserId(7),
            active: true,
        });
        assert_eq!(count, 1);
        let event = receiver.recv().await.unwrap();
        assert_eq!(
            event,
            BrokerEvent::ProtocolChanged {
                user_id: maren_core::UserId(7),
                active: true,
            }
        );
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_slots() {
        let broker = Broker::new();
        broker.set_string("a", "1", Some(Duration::from_millis(5)));
        broker.set_string("b", "1", None);
        broker.push_back("l", &1).unwrap();
        broker.set_list_ttl("l", Some(Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = broker.sweep_expired();
        assert_eq!(reaped, 2);
        assert_eq!(broker.get_string("b").as_deref(), Some("1"));
    }

    #[test]
    fn test_drain_list_empties() {
        let broker = Broker::new();
        broker.push_back("d", &"x".to_string()).unwrap();
        broker.push_back("d", &"y".to_string()).unwrap();
        let drained: Vec<String> = broker.drain_list("d").unwrap();
        assert_eq!(drained, vec!["x", "y"]);
        assert_eq!(broker.list_len("d"), 0);
    }

    #[test]
    fn test_list_keys_by_prefix() {
        let broker = Broker::new();
        broker.push_back("processing:w1", &1).unwrap();
        broker.push_back("processing:w2", &1).unwrap();
        broker.push_back("intake", &1).unwrap();
        let mut keys = broker.list_keys("processing:");
        keys.sort();
        assert_eq!(keys, vec!["processing:w1", "processing:w2"]);
    }
}
