#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Configuration for the Maren daemon.
//!
//! A single [`Config`] covers every tunable named in the specification:
//! debounce windows, memory bounds, recovery tiers and caps, LLM profiles
//! with pricing, review-service secrets, queue watermarks, and timeouts.
//!
//! Resolution order, lowest to highest precedence:
//!
//! 1. Embedded defaults (`defaults.toml` compiled into the binary)
//! 2. An optional TOML file (`--config` or `MAREN_CONFIG`)
//! 3. Environment variables (`MAREN_*`, plus the bare option names from the
//!    deployment contract, e.g. `DEBOUNCE_SECONDS`, `REVIEW_AUTH_TOKEN`)
//!
//! Every section defaults to working values so a bare `[section]` header in
//! TOML produces a runnable configuration; only secrets (platform token,
//! review auth token, provider API keys) must come from the operator.

pub mod env;
pub mod error;
pub mod loader;
pub mod types;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl Config {
    /// Load configuration: defaults → optional file → env overrides →
    /// validation.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file is malformed or the final
    /// configuration fails validation.
    pub fn load(file: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(file)
    }
}
