//! Configuration struct definitions.
//!
//! All types are self-contained; conversion to domain types happens at the
//! integration boundary (daemon startup). Every struct implements [`Default`]
//! with the specification's default values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the Maren daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Persona identity and prompt blocks.
    pub persona: PersonaSection,
    /// Chat-platform transport settings.
    pub platform: PlatformSection,
    /// Per-user debouncing/batching.
    pub debounce: DebounceSection,
    /// Bounded conversation memory.
    pub memory: MemorySection,
    /// LLM profiles, models, and pricing.
    pub llm: LlmSection,
    /// Safety-filter lexicon extensions.
    pub safety: SafetySection,
    /// Reviewer HTTP API.
    pub review: ReviewSection,
    /// Queue watermarks.
    pub queues: QueuesSection,
    /// Recovery tiers, caps, and pacing.
    pub recovery: RecoverySection,
    /// Worker pool sizes and retry budget.
    pub workers: WorkersSection,
    /// Outbound call timeouts.
    pub timeouts: TimeoutsSection,
    /// Message store location.
    pub store: StoreSection,
    /// Logging level and format.
    pub logging: LoggingSection,
}

/// Persona identity: everything that goes into the stable prompt prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaSection {
    /// Persona display name.
    pub name: String,
    /// Base persona block for the generator prompt.
    pub system_prompt: String,
    /// Ordered prompt variants; the identity-conflict path rotates through
    /// these per user.
    pub prompt_variants: Vec<String>,
    /// Persona's declared timezone as minutes east of UTC; used only for
    /// wall-clock text inside prompts.
    pub utc_offset_minutes: i32,
    /// Fixed instruction block for the bubble refiner. Part of the stable
    /// prefix; must never interpolate per-message data.
    pub refiner_directive: String,
}

impl Default for PersonaSection {
    fn default() -> Self {
        Self {
            name: "Maren".to_string(),
            system_prompt: String::new(),
            prompt_variants: Vec::new(),
            utc_offset_minutes: 0,
            refiner_directive: "Rewrite the draft as a sequence of casual message bubbles \
                separated by the literal token [BUBBLE], preserving meaning, without \
                conversing with it."
                .to_string(),
        }
    }
}

/// Chat-platform transport settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PlatformSection {
    /// Bot token. Prefer the environment over a file.
    pub token: Option<String>,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self { token: None }
    }
}

impl std::fmt::Debug for PlatformSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformSection")
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

impl Serialize for PlatformSection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("PlatformSection", 0)?;
        state.end()
    }
}

/// Per-user debouncing/batching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceSection {
    /// Quiet window before a buffer is released (seconds).
    pub window_seconds: u64,
    /// Maximum messages folded into one processing unit.
    pub max_batch: usize,
    /// Maximum wait from the first buffered message (seconds).
    pub max_wait_seconds: u64,
    /// TTL of the per-user typing flag (seconds).
    pub typing_window_seconds: u64,
}

impl Default for DebounceSection {
    fn default() -> Self {
        Self {
            window_seconds: 5,
            max_batch: 5,
            max_wait_seconds: 30,
            typing_window_seconds: 5,
        }
    }
}

/// Bounded conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Maximum history entries per user.
    pub max_messages: usize,
    /// Maximum total history bytes per user.
    pub max_bytes: usize,
    /// Days of inactivity before a user's history is dropped.
    pub history_ttl_days: i64,
    /// Entries of recent history included in prompts.
    pub recent_window: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_messages: 50,
            max_bytes: 102_400,
            history_ttl_days: 30,
            recent_window: 6,
        }
    }
}

/// Cache-hint strategy for the refiner prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheHintStrategy {
    /// Keep the opening span of every refiner prompt byte-identical and mark
    /// it for provider-side caching.
    #[default]
    StablePrefix,
    /// No cache shaping.
    None,
}

/// One logical model role inside a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// Model name; must exist in `[llm.models]`.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Hard completion token cap.
    pub max_tokens: u32,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// A named generation/refinement profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Ordered fallback model names tried when the primary is unavailable.
    pub fallback_chain: Vec<String>,
    /// Cache shaping for the refiner prompt.
    pub cache_hint_strategy: CacheHintStrategy,
    /// Optional per-model daily request quotas.
    pub daily_quota: HashMap<String, u64>,
    /// Generator role.
    pub generator: RoleConfig,
    /// Refiner role (coherence analysis and bubble formatting).
    pub refiner: RoleConfig,
}

/// Token pricing for one model, USD per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Price per million prompt tokens.
    pub input_per_million: f64,
    /// Price per million completion tokens.
    pub output_per_million: f64,
    /// Price per million cached prompt tokens.
    pub cached_per_million: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cached_per_million: 0.3,
        }
    }
}

/// Provider binding and pricing for one model name.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ModelEntry {
    /// Provider identifier: `"anthropic"` or `"openai"` (OpenAI-compatible).
    pub provider: String,
    /// API key; prefer the environment over a file.
    pub api_key: Option<String>,
    /// Base URL override for OpenAI-compatible endpoints.
    pub api_url: Option<String>,
    /// Token pricing used for cost accounting.
    pub pricing: PricingConfig,
}

impl Default for ModelEntry {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            api_key: None,
            api_url: None,
            pricing: PricingConfig::default(),
        }
    }
}

impl std::fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEntry")
            .field("provider", &self.provider)
            .field("has_api_key", &self.api_key.is_some())
            .field("has_api_url", &self.api_url.is_some())
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl Serialize for ModelEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ModelEntry", 2)?;
        state.serialize_field("provider", &self.provider)?;
        state.serialize_field("pricing", &self.pricing)?;
        state.end()
    }
}

/// LLM profiles, model registry, and the small repair model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// Active profile name; hot-swappable at runtime.
    pub profile: String,
    /// Small model used for the one JSON repair pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_model: Option<String>,
    /// Named profiles.
    pub profiles: HashMap<String, ProfileConfig>,
    /// Model registry: name → provider binding and pricing.
    pub models: HashMap<String, ModelEntry>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            profiles: HashMap::new(),
            models: HashMap::new(),
            repair_model: None,
        }
    }
}

/// Safety-filter lexicon extensions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    /// Extra terms per category tag, merged into the built-in lexicon.
    pub extra_terms: HashMap<String, Vec<String>>,
}

/// Reviewer HTTP API settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    /// Listen address for the reviewer API.
    pub listen_addr: String,
    /// Bearer token reviewers authenticate with.
    pub auth_token: Option<String>,
    /// CORS allow-list origins.
    pub allowed_origins: Vec<String>,
    /// Per-IP request budget per minute on mutating endpoints.
    pub rate_limit_per_minute: u32,
    /// Priority weight on item age.
    pub age_weight: f64,
    /// Priority weight on user value.
    pub value_weight: f64,
    /// Priority weight on safety risk.
    pub risk_weight: f64,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8420".to_string(),
            auth_token: None,
            allowed_origins: Vec::new(),
            rate_limit_per_minute: 60,
            age_weight: 0.4,
            value_weight: 0.3,
            risk_weight: 0.3,
        }
    }
}

impl std::fmt::Debug for ReviewSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewSection")
            .field("listen_addr", &self.listen_addr)
            .field("has_auth_token", &self.auth_token.is_some())
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .finish()
    }
}

impl Serialize for ReviewSection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ReviewSection", 6)?;
        state.serialize_field("listen_addr", &self.listen_addr)?;
        state.serialize_field("allowed_origins", &self.allowed_origins)?;
        state.serialize_field("rate_limit_per_minute", &self.rate_limit_per_minute)?;
        state.serialize_field("age_weight", &self.age_weight)?;
        state.serialize_field("value_weight", &self.value_weight)?;
        state.serialize_field("risk_weight", &self.risk_weight)?;
        state.end()
    }
}

/// Queue watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesSection {
    /// Intake length above which ingress slows down and warns.
    pub intake_high_watermark: usize,
    /// Approved-list length above which the UI banners and dispatch scales.
    pub approved_high_watermark: usize,
}

impl Default for QueuesSection {
    fn default() -> Self {
        Self {
            intake_high_watermark: 5_000,
            approved_high_watermark: 500,
        }
    }
}

/// Recovery tiers, caps, pacing, and breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// Messages older than this are logged and skipped (hours).
    pub max_age_hours: i64,
    /// Tier-1 upper age bound (hours); tier-1 ingests immediately.
    pub tier1_max_hours: i64,
    /// Tier-2 upper age bound (hours).
    pub tier2_max_hours: i64,
    /// Inter-batch pacing for tier 2 (seconds).
    pub tier2_pacing_seconds: u64,
    /// Inter-batch pacing for tier 3 (seconds).
    pub tier3_pacing_seconds: u64,
    /// Batch size per tier.
    pub batch_size: usize,
    /// Hard cap on messages per recovery invocation.
    pub max_messages_per_run: u32,
    /// Hard cap on users examined per invocation.
    pub max_users_per_run: u32,
    /// Platform request budget (requests per second).
    pub rate_per_sec: u32,
    /// Token-bucket burst.
    pub burst: u32,
    /// Concurrent per-user history fetches.
    pub worker_concurrency: usize,
    /// Consecutive platform errors before the breaker trips.
    pub breaker_threshold: u32,
    /// Breaker cooldown before the scheduled retry (seconds).
    pub breaker_cooldown_seconds: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_age_hours: 12,
            tier1_max_hours: 2,
            tier2_max_hours: 6,
            tier2_pacing_seconds: 2,
            tier3_pacing_seconds: 10,
            batch_size: 5,
            max_messages_per_run: 100,
            max_users_per_run: 50,
            rate_per_sec: 30,
            burst: 10,
            worker_concurrency: 10,
            breaker_threshold: 5,
            breaker_cooldown_seconds: 60,
        }
    }
}

/// Worker pool sizes and the supervisor retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// Intake drain workers.
    pub intake: usize,
    /// Supervisor workers.
    pub supervisor: usize,
    /// Dispatch workers.
    pub dispatch: usize,
    /// Supervisor retries per unit before dead-lettering.
    pub retry_max: u32,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            intake: 4,
            supervisor: 8,
            dispatch: 2,
            retry_max: 3,
        }
    }
}

/// Outbound call timeouts, milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// Platform API calls.
    pub platform_ms: u64,
    /// LLM provider calls.
    pub llm_ms: u64,
    /// Message store calls.
    pub store_ms: u64,
    /// Broker/cache calls.
    pub cache_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            platform_ms: 20_000,
            llm_ms: 30_000,
            store_ms: 5_000,
            cache_ms: 1_000,
        }
    }
}

/// Message store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database path; `:memory:` for an ephemeral store.
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: "maren.db".to_string(),
        }
    }
}

/// Logging level and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default level filter (overridable via `RUST_LOG`).
    pub level: String,
    /// `"pretty"` or `"json"`.
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.debounce.window_seconds, 5);
        assert_eq!(config.debounce.max_batch, 5);
        assert_eq!(config.debounce.max_wait_seconds, 30);
        assert_eq!(config.memory.max_messages, 50);
        assert_eq!(config.memory.max_bytes, 102_400);
        assert_eq!(config.recovery.max_age_hours, 12);
        assert_eq!(config.recovery.max_messages_per_run, 100);
        assert_eq!(config.recovery.max_users_per_run, 50);
        assert_eq!(config.recovery.rate_per_sec, 30);
        assert_eq!(config.queues.intake_high_watermark, 5_000);
        assert_eq!(config.queues.approved_high_watermark, 500);
        assert_eq!(config.timeouts.platform_ms, 20_000);
        assert_eq!(config.timeouts.llm_ms, 30_000);
        assert_eq!(config.timeouts.store_ms, 5_000);
        assert_eq!(config.timeouts.cache_ms, 1_000);
        assert_eq!(config.workers.retry_max, 3);
    }

    #[test]
    fn test_secrets_not_serialized() {
        let mut config = Config::default();
        config.platform.token = Some("secret-token".to_string());
        config.review.auth_token = Some("secret-auth".to_string());
        let rendered = toml::to_string(&config).unwrap();
        assert!(!rendered.contains("secret-token"));
        assert!(!rendered.contains("secret-auth"));
    }

    #[test]
    fn test_empty_sections_deserialize() {
        let config: Config = toml::from_str("[persona]\n[llm]\n[review]\n").unwrap();
        assert_eq!(config.persona.name, "Maren");
        assert_eq!(config.review.rate_limit_per_minute, 60);
    }
}
