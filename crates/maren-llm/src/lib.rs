#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! LLM routing for the Maren pipeline.
//!
//! The [`Router`] owns a set of named profiles, each configuring a
//! `generator` and a `refiner` role. Per call it walks the role's model
//! chain (primary, then `fallback_chain`), enforcing day-scoped quotas via
//! broker counters, retrying transient provider errors with exponential
//! backoff, and failing over immediately on rate limits. Costs are computed
//! from per-model pricing and returned as [`maren_core::StageUsage`].
//!
//! Refiner calls carry a [`StablePrompt`]: an opening span that is
//! byte-identical across calls (persona block, fixed instructions, the
//! slow-moving user summary) followed by the dynamic tail. Providers mark
//! the stable span for provider-side prompt caching when the profile asks
//! for it.

mod anthropic;
pub mod error;
mod openai;
mod provider;
mod router;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use error::{LlmError, LlmResult};
pub use openai::OpenAiCompatProvider;
pub use provider::{CompletionProvider, ProviderRequest, RawCompletion};
pub use router::{Router, RouterConfig};
pub use types::{Generation, ModelPricing, ProfileSpec, RoleKind, RoleSpec, StablePrompt};
