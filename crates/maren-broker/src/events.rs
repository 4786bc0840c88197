//! Broker pub/sub.
//!
//! A single broadcast channel carries coordination events to every
//! subscriber. Delivery is at-most-once per subscriber: a lagged receiver
//! drops the oldest events and keeps going, which is acceptable because all
//! events here are cache-invalidation or advisory signals whose truth lives
//! in the store.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use maren_core::UserId;

/// Default channel capacity.
pub(crate) const CHANNEL_CAPACITY: usize = 1024;

/// Coordination events published through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerEvent {
    /// A user's quarantine state changed. Consumed by the activity tracker
    /// (drains pending buffers) and the dispatcher (aborts delivery).
    ProtocolChanged {
        /// The user whose state flipped.
        user_id: UserId,
        /// New state: `true` means quarantined.
        active: bool,
    },
    /// The intake list crossed its high watermark.
    IntakeBackpressure {
        /// Current intake depth.
        depth: usize,
    },
}

/// Receiver for broker events.
pub struct EventReceiver {
    pub(crate) receiver: broadcast::Receiver<BrokerEvent>,
}

impl EventReceiver {
    /// Receive the next event, skipping over any dropped by lag.
    ///
    /// Returns `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "broker event receiver lagged");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<BrokerEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "broker event receiver lagged");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}
