#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Reviewer-facing HTTP API.
//!
//! A plain JSON-over-HTTP surface for the reviewer UI: the prioritized
//! pending queue, claim/approve/reject, user and protocol management,
//! quarantine inspection, recovery control, and model-profile switching.
//!
//! Every mutating endpoint requires the configured bearer token plus an
//! `X-Reviewer` identity header. Per-IP rate limits ride on broker
//! counters; all responses carry the standard security headers; CORS is
//! restricted to the configured allow-list.

pub mod dto;
pub mod error;
mod routes;
mod service;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use service::ReviewService;
pub use state::ApiState;
