#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Durable message store for the Maren pipeline.
//!
//! Single SQLite database behind a [`Store`] handle. The store exclusively
//! owns the durable entities: users, interactions, processing cursors,
//! recovery operations, quarantine entries, protocol states, commitments,
//! coherence records, conversation memory, the intake log, and the edit
//! taxonomy.
//!
//! Two store-level mechanisms carry pipeline invariants:
//!
//! - The `message_index` table gives every ingested platform message id
//!   exactly one location (`intake` / `quarantine` / `interaction`); its
//!   primary key turns duplicate ingestion into a constraint violation.
//! - Processing cursors only move forward: updates are compare-and-set
//!   (`WHERE last_message_id < new`), so the cursor is monotonic no matter
//!   how callers race.
//!
//! Every public operation runs under the configured store timeout.

mod commitments;
mod cursors;
mod db;
pub mod error;
mod intake;
mod interactions;
mod memory;
mod protocol;
mod quarantine;
mod recovery;
mod users;

pub use db::Store;
pub use error::{StoreError, StoreResult};
pub use intake::IntakeRow;
pub use interactions::PendingRow;
pub use memory::MemoryRow;
