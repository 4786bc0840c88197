#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Telegram transport for the Maren pipeline.
//!
//! Implements [`maren_core::PlatformClient`] over the Bot API via
//! `teloxide`. Two Bot API realities shape this adapter:
//!
//! - Bots cannot enumerate dialogs or fetch chat history server-side. The
//!   adapter keeps its own bounded per-user message registry, fed by the
//!   update stream. While the daemon is down, Telegram retains undelivered
//!   updates (about 24 hours); draining that backlog at startup populates
//!   the registry, which is exactly the window the recovery tiers cover.
//! - Bots never receive user typing updates, so this transport simply
//!   produces no typing events; the debouncer's typing awareness is
//!   feature-gated by what the platform delivers.

mod listener;
mod platform;

pub use listener::run_listener;
pub use platform::TelegramPlatform;
