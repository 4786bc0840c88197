//! Environment variable overrides.
//!
//! Two spellings are accepted for every option: the `MAREN_`-prefixed form
//! and the bare name from the deployment contract (`DEBOUNCE_SECONDS`,
//! `REVIEW_AUTH_TOKEN`, ...). The prefixed form wins when both are set.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Apply overrides from the process environment.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] when a set variable has an unparseable
/// value. Unset variables are ignored.
pub fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    apply_overrides_from(config, |name| {
        std::env::var(format!("MAREN_{name}"))
            .or_else(|_| std::env::var(name))
            .ok()
    })
}

fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> ConfigResult<T> {
    raw.parse().map_err(|_| ConfigError::EnvError {
        var: name.to_owned(),
        message: format!("could not parse {raw:?}"),
    })
}

/// Apply overrides from an arbitrary lookup. Split out so tests can inject
/// values without mutating process state.
#[allow(clippy::too_many_lines)]
pub(crate) fn apply_overrides_from(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<()> {
    macro_rules! override_num {
        ($target:expr, $name:literal) => {
            if let Some(raw) = lookup($name) {
                $target = parse($name, &raw)?;
            }
        };
    }

    override_num!(config.debounce.window_seconds, "DEBOUNCE_SECONDS");
    override_num!(config.debounce.max_batch, "MAX_BATCH");
    override_num!(config.debounce.max_wait_seconds, "MAX_WAIT_SECONDS");
    override_num!(
        config.debounce.typing_window_seconds,
        "TYPING_WINDOW_SECONDS"
    );

    override_num!(config.memory.max_messages, "MEMORY_MAX_MESSAGES");
    override_num!(config.memory.max_bytes, "MEMORY_MAX_BYTES");

    override_num!(config.recovery.max_age_hours, "RECOVERY_MAX_AGE_HOURS");
    override_num!(
        config.recovery.max_messages_per_run,
        "RECOVERY_MAX_MESSAGES_PER_RUN"
    );
    override_num!(
        config.recovery.max_users_per_run,
        "RECOVERY_MAX_USERS_PER_RUN"
    );
    override_num!(config.recovery.rate_per_sec, "RECOVERY_RATE_PER_SEC");

    override_num!(config.queues.intake_high_watermark, "INTAKE_HIGH_WATERMARK");
    override_num!(
        config.queues.approved_high_watermark,
        "APPROVED_HIGH_WATERMARK"
    );

    override_num!(config.timeouts.platform_ms, "PLATFORM_TIMEOUT_MS");
    override_num!(config.timeouts.llm_ms, "LLM_TIMEOUT_MS");
    override_num!(config.timeouts.store_ms, "STORE_TIMEOUT_MS");
    override_num!(config.timeouts.cache_ms, "CACHE_TIMEOUT_MS");

    override_num!(config.workers.retry_max, "RETRY_MAX");

    if let Some(profile) = lookup("LLM_PROFILE") {
        config.llm.profile = profile;
    }
    if let Some(token) = lookup("REVIEW_AUTH_TOKEN") {
        config.review.auth_token = Some(token);
    }
    if let Some(origins) = lookup("ALLOWED_ORIGINS") {
        config.review.allowed_origins = origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(token) = lookup("PLATFORM_TOKEN") {
        config.platform.token = Some(token);
    }
    if let Some(path) = lookup("STORE_PATH") {
        config.store.path = path;
    }

    Ok(())
}
