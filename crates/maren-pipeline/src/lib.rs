#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! The Maren processing pipeline.
//!
//! Everything between the chat platform and the reviewer lives here:
//!
//! - [`ingress`]: platform events → protocol gate → durable intake
//! - [`protocol`]: per-user quarantine state with read-through caching
//! - [`tracker`]: per-user debouncing/batching of rapid messages
//! - [`supervisor`]: the generate → coherence-check → bubble pipeline
//! - [`safety`]: deterministic content annotation
//! - [`dispatch`]: paced delivery of approved bubbles
//! - [`recovery`]: startup/manual reconciliation with platform history
//! - [`workers`]: the long-running worker pool and shutdown wiring
//! - [`janitor`]: stale-list re-injection and periodic maintenance
//!
//! Components receive a shared [`Resources`] record at construction; there
//! is no global state. Cancellation propagates through a
//! [`tokio_util::sync::CancellationToken`] plus the broker's
//! `protocol_changed` channel for per-user aborts.

pub mod dispatch;
pub mod error;
pub mod ingress;
pub mod janitor;
pub mod prompts;
pub mod protocol;
pub mod recovery;
pub mod safety;
pub mod supervisor;
pub mod tracker;
pub mod workers;

mod resources;

pub use error::{PipelineError, PipelineResult};
pub use resources::Resources;
