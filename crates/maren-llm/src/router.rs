//! Profile-driven model routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use maren_core::StageUsage;
use maren_broker::{Broker, keys};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{LlmError, LlmResult};
use crate::provider::{CompletionProvider, ProviderRequest};
use crate::types::{Generation, ModelPricing, ProfileSpec, RoleKind, StablePrompt};

/// First retry delay for transient provider errors.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Backoff multiplier per attempt.
const BACKOFF_FACTOR: u32 = 2;
/// Attempts per model before failing over.
const MAX_ATTEMPTS: u32 = 4;
/// Quota counters expire after two days.
const QUOTA_TTL: Duration = Duration::from_secs(48 * 3600);
/// Minimum stable-prefix size (in estimated tokens) for cache hits to pay.
const STABLE_PREFIX_MIN_TOKENS: usize = 1024;
/// Broker key for the degraded flag `/models/current` reports.
const DEGRADED_KEY: &str = "llm:degraded";

/// Static router configuration, converted from the config sections at
/// daemon startup.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Named profiles.
    pub profiles: HashMap<String, ProfileSpec>,
    /// Profile active at startup.
    pub active_profile: String,
    /// Pricing per model name.
    pub pricing: HashMap<String, ModelPricing>,
    /// Small model for the one JSON repair pass.
    pub repair_model: Option<String>,
    /// Per-call timeout.
    pub call_timeout: Duration,
}

/// The LLM router.
pub struct Router {
    config: RouterConfig,
    active: RwLock<String>,
    providers: HashMap<String, Arc<dyn CompletionProvider>>,
    broker: Arc<Broker>,
}

impl Router {
    /// Build a router over a provider registry.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::UnknownProfile`] when the configured active
    /// profile is not defined.
    pub fn new(
        config: RouterConfig,
        providers: HashMap<String, Arc<dyn CompletionProvider>>,
        broker: Arc<Broker>,
    ) -> LlmResult<Self> {
        if !config.profiles.contains_key(&config.active_profile) {
            return Err(LlmError::UnknownProfile(config.active_profile.clone()));
        }
        let active = RwLock::new(config.active_profile.clone());
        Ok(Self {
            config,
            active,
            providers,
            broker,
        })
    }

    /// Name of the currently active profile.
    pub async fn current_profile(&self) -> String {
        self.active.read().await.clone()
    }

    /// All profile names.
    #[must_use]
    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Hot-swap the active profile. In-flight calls keep the profile they
    /// resolved at entry.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::UnknownProfile`] for undefined names.
    pub async fn switch_profile(&self, name: &str) -> LlmResult<()> {
        if !self.config.profiles.contains_key(name) {
            return Err(LlmError::UnknownProfile(name.to_owned()));
        }
        let mut active = self.active.write().await;
        info!(from = %*active, to = name, "switching model profile");
        *active = name.to_owned();
        Ok(())
    }

    /// Whether the last routed call ran out of quota across its chain.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.broker.get_string(DEGRADED_KEY).is_some()
    }

    /// First-stage generation.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::QuotaExhausted`] when the whole chain is dry, or
    /// the last provider error after retries.
    pub async fn generate(&self, system: &str, user: &str) -> LlmResult<Generation> {
        self.complete_role(RoleKind::Generator, system, user, false)
            .await
    }

    /// Bubble formatting through the stable-prefix layout.
    ///
    /// # Errors
    ///
    /// Same failure surface as [`Router::generate`].
    pub async fn refine(&self, prompt: &StablePrompt) -> LlmResult<Generation> {
        let profile = self.active_profile_spec().await;
        if profile.stable_prefix_caching
            && prompt.stable_token_estimate() < STABLE_PREFIX_MIN_TOKENS
        {
            debug!(
                estimate = prompt.stable_token_estimate(),
                "stable prefix below cache-effective size"
            );
        }
        self.complete_role(
            RoleKind::Refiner,
            &prompt.stable,
            &prompt.dynamic,
            profile.stable_prefix_caching,
        )
        .await
    }

    /// Coherence analysis: a refiner call with a distinct system directive
    /// and no cache shaping (the directive is small and per-purpose).
    ///
    /// # Errors
    ///
    /// Same failure surface as [`Router::generate`].
    pub async fn analyze(&self, directive: &str, content: &str) -> LlmResult<Generation> {
        self.complete_role(RoleKind::Refiner, directive, content, false)
            .await
    }

    /// One repair pass through the configured small model. No fallback, no
    /// retry; callers treat failure as "still malformed".
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::UnknownModel`] when no repair model is
    /// configured, or the provider's error.
    pub async fn repair(&self, directive: &str, content: &str) -> LlmResult<Generation> {
        let model = self
            .config
            .repair_model
            .as_deref()
            .ok_or_else(|| LlmError::UnknownModel {
                model: "<repair>".to_owned(),
            })?;
        let provider = self
            .providers
            .get(model)
            .ok_or_else(|| LlmError::UnknownModel {
                model: model.to_owned(),
            })?;
        let request = ProviderRequest {
            system: directive.to_owned(),
            user: content.to_owned(),
            temperature: 0.0,
            max_tokens: 1024,
            cache_system: false,
        };
        let raw = self.call_with_timeout(provider.as_ref(), &request).await?;
        Ok(self.account(model, raw))
    }

    async fn active_profile_spec(&self) -> ProfileSpec {
        let name = self.active.read().await.clone();
        // The constructor and switch_profile guarantee presence.
        self.config.profiles.get(&name).cloned().unwrap_or_else(|| {
            ProfileSpec {
                generator: crate::types::RoleSpec {
                    model: String::new(),
                    temperature: 0.7,
                    max_tokens: 1024,
                },
                refiner: crate::types::RoleSpec {
                    model: String::new(),
                    temperature: 0.4,
                    max_tokens: 1024,
                },
                fallback_chain: Vec::new(),
                daily_quota: HashMap::new(),
                stable_prefix_caching: false,
            }
        })
    }

    async fn complete_role(
        &self,
        role: RoleKind,
        system: &str,
        user: &str,
        cache_system: bool,
    ) -> LlmResult<Generation> {
        let profile = self.active_profile_spec().await;
        let spec = match role {
            RoleKind::Generator => &profile.generator,
            RoleKind::Refiner => &profile.refiner,
        };

        let mut chain = vec![spec.model.clone()];
        chain.extend(profile.fallback_chain.iter().cloned());

        let request = ProviderRequest {
            system: system.to_owned(),
            user: user.to_owned(),
            temperature: spec.temperature,
            max_tokens: spec.max_tokens,
            cache_system,
        };

        let mut last_error: Option<LlmError> = None;
        let mut malformed_seen = false;
        let mut all_quota = true;

        for model in &chain {
            if let Some(&limit) = profile.daily_quota.get(model) {
                let day = chrono::Utc::now().format("%Y%m%d").to_string();
                let count = self.broker.incr(&keys::quota(model, &day), Some(QUOTA_TTL));
                if count > i64::try_from(limit).unwrap_or(i64::MAX) {
                    warn!(model, count, limit, "daily quota reached, failing over");
                    continue;
                }
            }
            let Some(provider) = self.providers.get(model) else {
                warn!(model, "no provider registered, failing over");
                all_quota = false;
                continue;
            };

            let mut delay = BACKOFF_BASE;
            for attempt in 1..=MAX_ATTEMPTS {
                match self.call_with_timeout(provider.as_ref(), &request).await {
                    Ok(raw) => {
                        self.broker.delete_string(DEGRADED_KEY);
                        return Ok(self.account(model, raw));
                    },
                    Err(err @ (LlmError::TransientProvider(_) | LlmError::Http(_))) => {
                        all_quota = false;
                        warn!(model, attempt, %err, "transient provider error");
                        last_error = Some(err);
                        if attempt < MAX_ATTEMPTS {
                            tokio::time::sleep(delay).await;
                            delay = delay.saturating_mul(BACKOFF_FACTOR);
                        }
                    },
                    Err(err @ LlmError::RateLimited { .. }) => {
                        all_quota = false;
                        warn!(model, %err, "rate limited, failing over");
                        last_error = Some(err);
                        break;
                    },
                    Err(err @ LlmError::MalformedResponse(_)) => {
                        all_quota = false;
                        if malformed_seen {
                            return Err(err);
                        }
                        malformed_seen = true;
                        warn!(model, %err, "malformed response, failing over once");
                        last_error = Some(err);
                        break;
                    },
                    Err(err) => {
                        all_quota = false;
                        warn!(model, %err, "provider unusable, failing over");
                        last_error = Some(err);
                        break;
                    },
                }
            }
        }

        if all_quota {
            self.broker.set_string(DEGRADED_KEY, "quota", None);
            return Err(LlmError::QuotaExhausted {
                role: role.as_str().to_owned(),
            });
        }
        Err(last_error.unwrap_or(LlmError::QuotaExhausted {
            role: role.as_str().to_owned(),
        }))
    }

    async fn call_with_timeout(
        &self,
        provider: &dyn CompletionProvider,
        request: &ProviderRequest,
    ) -> LlmResult<crate::provider::RawCompletion> {
        match tokio::time::timeout(self.config.call_timeout, provider.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::TransientProvider(format!(
                "call to {} timed out",
                provider.model()
            ))),
        }
    }

    fn account(&self, model: &str, raw: crate::provider::RawCompletion) -> Generation {
        let pricing = self.config.pricing.get(model).copied().unwrap_or(ModelPricing {
            input_per_million: 0.0,
            output_per_million: 0.0,
            cached_per_million: 0.0,
        });
        Generation {
            usage: StageUsage {
                model: model.to_owned(),
                tokens_in: raw.tokens_in,
                tokens_out: raw.tokens_out,
                cached_tokens: raw.cached_tokens,
                cost_usd: pricing.cost(raw.tokens_in, raw.tokens_out, raw.cached_tokens),
            },
            text: raw.text,
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("profiles", &self.config.profiles.len())
            .field("models", &self.providers.len())
            .finish_non_exhaustive()
    }
}
