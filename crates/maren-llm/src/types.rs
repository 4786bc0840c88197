//! Router-facing types.
//!
//! These mirror the configuration shapes; the daemon converts its config
//! sections into them at startup so this crate stays independent of the
//! config crate.

use std::collections::HashMap;

use maren_core::StageUsage;
use serde::{Deserialize, Serialize};

/// Which logical role a call plays within a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// First-stage persona reply drafting.
    Generator,
    /// Second-stage work: coherence analysis and bubble formatting.
    Refiner,
}

impl RoleKind {
    /// Human-readable role name for logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Refiner => "refiner",
        }
    }
}

/// One role's model binding inside a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Model name; must have a registered provider.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Hard completion token cap.
    pub max_tokens: u32,
}

/// A named profile: generator + refiner bindings and shared fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSpec {
    /// Generator role.
    pub generator: RoleSpec,
    /// Refiner role.
    pub refiner: RoleSpec,
    /// Ordered fallback model names.
    pub fallback_chain: Vec<String>,
    /// Optional per-model daily request quotas.
    pub daily_quota: HashMap<String, u64>,
    /// Whether refiner prompts should mark their stable prefix for
    /// provider-side caching.
    pub stable_prefix_caching: bool,
}

/// Per-model token pricing, USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Prompt tokens.
    pub input_per_million: f64,
    /// Completion tokens.
    pub output_per_million: f64,
    /// Cached prompt tokens.
    pub cached_per_million: f64,
}

impl ModelPricing {
    /// Cost of a call in USD. Cached prompt tokens are billed at the cached
    /// rate, the remainder at the input rate.
    #[must_use]
    pub fn cost(&self, tokens_in: u64, tokens_out: u64, cached_tokens: u64) -> f64 {
        let uncached = tokens_in.saturating_sub(cached_tokens);
        #[allow(clippy::cast_precision_loss)]
        let (uncached, cached, out) = (uncached as f64, cached_tokens as f64, tokens_out as f64);
        (uncached * self.input_per_million
            + cached * self.cached_per_million
            + out * self.output_per_million)
            / 1_000_000.0
    }
}

/// A completed routed call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// The model's text output.
    pub text: String,
    /// Usage and cost, including which model actually served the call.
    pub usage: StageUsage,
}

/// A refiner prompt split into its cache-stable prefix and dynamic tail.
///
/// The prefix must be byte-identical across calls for a given user: persona
/// block + fixed instructions + the slow-moving summary. Everything
/// per-message goes in `dynamic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StablePrompt {
    /// Byte-identical opening span (sent as the system block).
    pub stable: String,
    /// Per-call tail (sent as the user message).
    pub dynamic: String,
}

impl StablePrompt {
    /// Rough token estimate of the stable span (4 bytes per token).
    #[must_use]
    pub fn stable_token_estimate(&self) -> usize {
        self.stable.len() / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_splits_cached_tokens() {
        let pricing = ModelPricing {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cached_per_million: 0.3,
        };
        // 2000 in, 1500 cached, 100 out:
        // 500 * 3 + 1500 * 0.3 + 100 * 15 = 1500 + 450 + 1500 = 3450 / 1e6
        let cost = pricing.cost(2000, 100, 1500);
        assert!((cost - 0.003_45).abs() < 1e-9);
    }

    #[test]
    fn test_cached_capped_by_input() {
        let pricing = ModelPricing {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cached_per_million: 0.3,
        };
        // cached > in must not go negative.
        let cost = pricing.cost(100, 0, 500);
        assert!(cost > 0.0);
    }

    #[test]
    fn test_stable_token_estimate() {
        let prompt = StablePrompt {
            stable: "x".repeat(4096),
            dynamic: "hi".to_string(),
        };
        assert_eq!(prompt.stable_token_estimate(), 1024);
    }
}
