//! Config file loading with layered precedence.
//!
//! 1. Parse embedded `defaults.toml`
//! 2. Deep-merge the operator's file (explicit path or `MAREN_CONFIG`)
//! 3. Apply environment overrides
//! 4. Validate

use std::path::Path;

use tracing::{debug, info};

use crate::env::apply_env_overrides;
use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Load configuration. See the crate docs for the precedence chain.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a file is unreadable or malformed, an env
/// override has an unparseable value, or validation fails.
pub fn load(file: Option<&Path>) -> ConfigResult<Config> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let env_path = std::env::var("MAREN_CONFIG").ok();
    let path = file
        .map(Path::to_path_buf)
        .or_else(|| env_path.map(std::path::PathBuf::from));

    if let Some(path) = path {
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            source: e,
        })?;
        let overlay: toml::Value = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
        deep_merge(&mut merged, overlay);
        info!(path = %path.display(), "loaded config file");
    } else {
        debug!("no config file; using embedded defaults");
    }

    let mut config: Config = merged
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: "<merged config>".to_owned(),
            source: e,
        })?;

    apply_env_overrides(&mut config)?;
    validate::validate(&config)?;
    Ok(config)
}

/// Parse a configuration from a TOML string over the embedded defaults.
/// Used by tests and by the daemon's `--check` mode.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the string is malformed or validation fails.
pub fn load_str(text: &str) -> ConfigResult<Config> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let overlay: toml::Value = toml::from_str(text).map_err(|e| ConfigError::ParseError {
        path: "<inline>".to_owned(),
        source: e,
    })?;
    deep_merge(&mut merged, overlay);
    let config: Config = merged
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: "<merged config>".to_owned(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Recursively merge `overlay` into `base`. Tables merge key-by-key;
/// everything else is replaced wholesale.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        },
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_and_validate() {
        let config = load_str("").unwrap();
        assert_eq!(config.debounce.window_seconds, 5);
        assert_eq!(config.llm.profile, "default");
    }

    #[test]
    fn test_overlay_wins() {
        let config = load_str("[debounce]\nwindow_seconds = 9\n").unwrap();
        assert_eq!(config.debounce.window_seconds, 9);
        // Untouched siblings keep their defaults.
        assert_eq!(config.debounce.max_batch, 5);
    }

    #[test]
    fn test_overlay_can_add_profiles() {
        let config = load_str(
            r#"
            [llm.profiles.cheap.generator]
            model = "claude-sonnet-4-20250514"
            [llm.profiles.cheap.refiner]
            model = "claude-sonnet-4-20250514"
            "#,
        )
        .unwrap();
        assert!(config.llm.profiles.contains_key("cheap"));
        assert!(config.llm.profiles.contains_key("default"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(load_str("debounce = [not toml").is_err());
    }

    #[test]
    fn test_bad_weights_rejected() {
        let result = load_str("[review]\nage_weight = 0.9\n");
        assert!(result.is_err());
    }
}
