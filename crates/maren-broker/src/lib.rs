#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! In-process queue broker for the Maren pipeline.
//!
//! The broker owns all transient coordination state: the intake FIFO, the
//! per-worker processing lists, the per-user debounce buffers, the sorted
//! review queue, the approved-outbound list, TTL'd cache strings (typing
//! flags, protocol state, outbound handles), day-scoped quota counters, the
//! per-user supervisor locks, and the `protocol_changed` pub/sub channel.
//!
//! Everything here is in-process and rebuildable: durable truth lives in the
//! message store, and the daemon reseeds the broker from it at startup. The
//! API deliberately keeps the wire shapes of the deployment contract (FIFO
//! lists with a blocking atomic move, a score-sorted set, set-if-absent
//! locks with TTL, atomic counters) so the coordination protocol reads the
//! same as it would against an external queue server.

mod broker;
pub mod error;
pub mod events;
pub mod keys;

pub use broker::{Broker, LockToken, ScoredMember};
pub use error::{BrokerError, BrokerResult};
pub use events::{BrokerEvent, EventReceiver};
