#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Core domain types for the Maren review pipeline.
//!
//! Maren is a human-in-the-loop moderation pipeline: every outbound message
//! is drafted by a model, checked for coherence against the persona's
//! commitments, split into chat bubbles, and held for human review before
//! anything reaches the user.
//!
//! This crate is the dependency root. It defines:
//! - Typed identifiers ([`ids`])
//! - The durable domain entities ([`types`])
//! - The error-kind taxonomy shared across the system ([`error`])
//! - The chat-platform seam ([`platform`]); the rest of the system only
//!   ever talks to the platform through [`platform::PlatformClient`]
//! - Wall-clock helpers ([`clock`])
//!
//! It deliberately has no dependencies on the other `maren-*` crates.

pub mod clock;
pub mod error;
pub mod ids;
pub mod platform;
pub mod types;

pub use error::{CoreError, CoreResult, ErrorKind};
pub use ids::{
    CommitmentId, InteractionId, PlatformMessageId, QuarantineEntryId, RecoveryOpId, ReviewerId,
    UserId,
};
pub use platform::{PlatformClient, PlatformError, PlatformEvent, PlatformMessage, PlatformUser};
pub use types::{
    CoherenceRecord, CoherenceStatus, Commitment, CommitmentStatus, DispatchJob, DispatchState,
    IntakeEntry, Interaction, ProcessingUnit, ProtocolState, QuarantineEntry, RecoveryOperation,
    RecoveryStatus, RecoveryTrigger, ReviewItem, ReviewStatus, SafetyAnnotation, StageUsage, User,
    review_priority,
};
