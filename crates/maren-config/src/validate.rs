//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Validate a fully-merged configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_debounce(config)?;
    validate_llm(config)?;
    validate_review(config)?;
    validate_recovery(config)?;
    validate_workers(config)?;
    Ok(())
}

fn err(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_debounce(config: &Config) -> ConfigResult<()> {
    let d = &config.debounce;
    if d.max_batch == 0 {
        return Err(err("debounce.max_batch", "must be at least 1"));
    }
    if d.max_wait_seconds < d.window_seconds {
        return Err(err(
            "debounce.max_wait_seconds",
            "must be at least the debounce window",
        ));
    }
    Ok(())
}

fn validate_llm(config: &Config) -> ConfigResult<()> {
    let llm = &config.llm;
    let Some(profile) = llm.profiles.get(&llm.profile) else {
        return Err(err(
            "llm.profile",
            format!("active profile '{}' is not defined", llm.profile),
        ));
    };

    for (role_name, role) in [("generator", &profile.generator), ("refiner", &profile.refiner)] {
        if role.model.is_empty() {
            return Err(err(
                &format!("llm.profiles.{}.{role_name}.model", llm.profile),
                "must name a model",
            ));
        }
        if !llm.models.contains_key(&role.model) {
            return Err(err(
                &format!("llm.profiles.{}.{role_name}.model", llm.profile),
                format!("model '{}' is not in [llm.models]", role.model),
            ));
        }
        if !(0.0..=2.0).contains(&role.temperature) {
            return Err(err(
                &format!("llm.profiles.{}.{role_name}.temperature", llm.profile),
                "must be between 0.0 and 2.0",
            ));
        }
        if role.max_tokens == 0 {
            return Err(err(
                &format!("llm.profiles.{}.{role_name}.max_tokens", llm.profile),
                "must be at least 1",
            ));
        }
    }

    for fallback in &profile.fallback_chain {
        if !llm.models.contains_key(fallback) {
            return Err(err(
                "llm.fallback_chain",
                format!("fallback model '{fallback}' is not in [llm.models]"),
            ));
        }
    }

    for (name, model) in &llm.models {
        if !matches!(model.provider.as_str(), "anthropic" | "openai") {
            return Err(err(
                &format!("llm.models.{name}.provider"),
                format!(
                    "unsupported provider '{}'; expected anthropic or openai",
                    model.provider
                ),
            ));
        }
        let p = &model.pricing;
        for (field, value) in [
            ("input_per_million", p.input_per_million),
            ("output_per_million", p.output_per_million),
            ("cached_per_million", p.cached_per_million),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(err(
                    &format!("llm.models.{name}.pricing.{field}"),
                    "must be a finite non-negative number",
                ));
            }
        }
    }

    Ok(())
}

fn validate_review(config: &Config) -> ConfigResult<()> {
    let r = &config.review;
    let sum = r.age_weight + r.value_weight + r.risk_weight;
    if !(0.99..=1.01).contains(&sum) {
        return Err(err(
            "review.age_weight",
            format!("priority weights must sum to 1.0, got {sum}"),
        ));
    }
    for (field, value) in [
        ("age_weight", r.age_weight),
        ("value_weight", r.value_weight),
        ("risk_weight", r.risk_weight),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(err(
                &format!("review.{field}"),
                "must be between 0.0 and 1.0",
            ));
        }
    }
    if r.rate_limit_per_minute == 0 {
        return Err(err("review.rate_limit_per_minute", "must be at least 1"));
    }
    Ok(())
}

fn validate_recovery(config: &Config) -> ConfigResult<()> {
    let r = &config.recovery;
    if !(r.tier1_max_hours < r.tier2_max_hours && r.tier2_max_hours <= r.max_age_hours) {
        return Err(err(
            "recovery.tier1_max_hours",
            "tier boundaries must satisfy tier1 < tier2 <= max_age",
        ));
    }
    if r.batch_size == 0 {
        return Err(err("recovery.batch_size", "must be at least 1"));
    }
    if r.rate_per_sec == 0 {
        return Err(err("recovery.rate_per_sec", "must be at least 1"));
    }
    Ok(())
}

fn validate_workers(config: &Config) -> ConfigResult<()> {
    let w = &config.workers;
    for (field, value) in [
        ("intake", w.intake),
        ("supervisor", w.supervisor),
        ("dispatch", w.dispatch),
    ] {
        if value == 0 {
            return Err(err(&format!("workers.{field}"), "must be at least 1"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_str;

    #[test]
    fn test_defaults_are_valid() {
        assert!(load_str("").is_ok());
    }

    #[test]
    fn test_unknown_active_profile_rejected() {
        let result = load_str("[llm]\nprofile = \"missing\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_fallback_must_be_registered() {
        let result = load_str("[llm.profiles.default]\nfallback_chain = [\"ghost-model\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_tier_order_enforced() {
        let result = load_str("[recovery]\ntier1_max_hours = 8\ntier2_max_hours = 6\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = load_str("[workers]\nsupervisor = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_default_struct_fails_without_profile() {
        // A bare `Config::default()` has no profiles at all; the loader always
        // goes through the embedded defaults, which do.
        let config = Config::default();
        assert!(validate(&config).is_err());
    }
}
