// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static option schemas.
//!
//! Every configurable key is described by an [`OptionSpec`]: its default, the values it may be
//! chosen from, and an optional check pattern. The tables are plain `static` data, populated at
//! compile time and never mutated.

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::error::ConfigError;

pub const KEY_FT_STRATEGY: &str = "ft_strategy";
pub const KEY_FT_MEMORY_CHANNEL: &str = "ft_memory_channel";
pub const KEY_FT_MEMORY_CHANNEL_SIZE: &str = "ft_memory_channel_size";
pub const KEY_FT_SAVE_LOG_PATH: &str = "ft_save_log_path";
pub const KEY_FT_WRITE_LIMIT: &str = "ft_write_limit";
pub const KEY_FT_SYNC_EVERY: &str = "ft_sync_every";
pub const KEY_FT_SYNC_INTERVAL_MS: &str = "ft_sync_interval_ms";
pub const KEY_FT_PROCS: &str = "ft_procs";
pub const KEY_FT_MAX_RETRIES: &str = "ft_max_retries";
pub const KEY_FT_RETRY_BACKOFF_MS: &str = "ft_retry_backoff_ms";
pub const KEY_FT_MAX_RETRY_BACKOFF_MS: &str = "ft_max_retry_backoff_ms";
pub const KEY_FT_TRIM_THRESHOLD_BYTES: &str = "ft_trim_threshold_bytes";
pub const KEY_FT_STOP_GRACE_MS: &str = "ft_stop_grace_ms";
pub const KEY_FLOW_RATE_LIMIT: &str = "flow_rate_limit";
pub const KEY_REQUEST_RATE_LIMIT: &str = "request_rate_limit";

pub const STRATEGY_BACKUP_ONLY: &str = "backup_only";
pub const STRATEGY_ALWAYS_SAVE: &str = "always_save";
pub const STRATEGY_CONCURRENT: &str = "concurrent";

const NUMERIC: Option<&str> = Some(r"\d+");
const BOOLEAN: &[&str] = &["false", "true"];

/// Anchored check patterns, compiled once per process.
static CHECK_PATTERNS: OnceLock<Mutex<HashMap<&'static str, Regex>>> = OnceLock::new();

fn check_pattern(pattern: &'static str) -> Result<Regex, regex::Error> {
    let mut cache = CHECK_PATTERNS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(compiled) = cache.get(pattern) {
        return Ok(compiled.clone());
    }
    let compiled = Regex::new(&format!("^(?:{pattern})$"))?;
    cache.insert(pattern, compiled.clone());
    Ok(compiled)
}

/// Description of a single configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionSpec {
    pub key: &'static str,
    /// Value used when the key is absent or empty. An empty default means "unset".
    pub default: &'static str,
    /// If non-empty, the value must be one of these.
    pub choose_options: &'static [&'static str],
    /// If set, the whole value must match this pattern.
    pub check_regex: Option<&'static str>,
    /// Whether the key must be present with a non-empty value.
    pub required: bool,
    pub description: &'static str,
}

impl OptionSpec {
    pub(crate) const fn new(key: &'static str, default: &'static str, description: &'static str) -> Self {
        OptionSpec {
            key,
            default,
            choose_options: &[],
            check_regex: None,
            required: false,
            description,
        }
    }

    pub(crate) const fn numeric(key: &'static str, default: &'static str, description: &'static str) -> Self {
        OptionSpec {
            check_regex: NUMERIC,
            ..OptionSpec::new(key, default, description)
        }
    }

    pub(crate) const fn choice(
        key: &'static str,
        choose_options: &'static [&'static str],
        default: &'static str,
        description: &'static str,
    ) -> Self {
        OptionSpec {
            choose_options,
            ..OptionSpec::new(key, default, description)
        }
    }

    pub(crate) const fn with_check(self, pattern: &'static str) -> Self {
        OptionSpec {
            check_regex: Some(pattern),
            ..self
        }
    }

    pub(crate) const fn required(self) -> Self {
        OptionSpec {
            required: true,
            ..self
        }
    }

    /// Checks a raw value against the choice list and the check pattern.
    pub fn validate(&self, value: &str) -> Result<(), ConfigError> {
        if value.is_empty() {
            if self.required {
                return Err(ConfigError::MissingOption(self.key.to_string()));
            }
            return Ok(());
        }

        if !self.choose_options.is_empty() && !self.choose_options.contains(&value) {
            return Err(self.invalid(
                value,
                format!("must be one of {}", self.choose_options.join(", ")),
            ));
        }

        if let Some(pattern) = self.check_regex {
            let full_match = check_pattern(pattern)
                .map_err(|e| self.invalid(value, format!("bad check pattern: {e}")))?;
            if !full_match.is_match(value) {
                return Err(self.invalid(value, format!("must match {pattern}")));
            }
        }

        Ok(())
    }

    fn invalid(&self, value: &str, reason: String) -> ConfigError {
        ConfigError::InvalidOption {
            key: self.key.to_string(),
            value: value.to_string(),
            reason,
        }
    }
}

/// Fault-tolerance options shared by every sink type.
pub static FT_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new(
        KEY_FT_SAVE_LOG_PATH,
        "",
        "Directory of the disk queue (ft_save_log_path)",
    ),
    OptionSpec::numeric(
        KEY_FT_WRITE_LIMIT,
        "",
        "Disk write limit in MB/s, unset for unlimited (ft_write_limit)",
    ),
    OptionSpec::numeric(
        KEY_FT_SYNC_EVERY,
        "10",
        "Queue changes between two syncs of the queue metadata (ft_sync_every)",
    ),
    OptionSpec::numeric(
        KEY_FT_SYNC_INTERVAL_MS,
        "1000",
        "Maximum time between two syncs of the queue metadata (ft_sync_interval_ms)",
    ),
    OptionSpec::choice(
        KEY_FT_STRATEGY,
        &[STRATEGY_BACKUP_ONLY, STRATEGY_ALWAYS_SAVE, STRATEGY_CONCURRENT],
        STRATEGY_BACKUP_ONLY,
        "Fault tolerance strategy: queue only failed batches, or every batch (ft_strategy)",
    ),
    OptionSpec::numeric(
        KEY_FT_PROCS,
        "",
        "Delivery workers for always_save or concurrent (ft_procs)",
    ),
    OptionSpec::choice(
        KEY_FT_MEMORY_CHANNEL,
        BOOLEAN,
        "false",
        "Use an in-memory ring instead of the disk queue (ft_memory_channel)",
    ),
    OptionSpec::numeric(
        KEY_FT_MEMORY_CHANNEL_SIZE,
        "100",
        "Maximum number of unacknowledged batches in the queue (ft_memory_channel_size)",
    ),
    OptionSpec::numeric(
        KEY_FT_MAX_RETRIES,
        "10",
        "Retries of a batch before it is dead-lettered (ft_max_retries)",
    ),
    OptionSpec::numeric(
        KEY_FT_RETRY_BACKOFF_MS,
        "100",
        "Base delay of the exponential retry backoff (ft_retry_backoff_ms)",
    ),
    OptionSpec::numeric(
        KEY_FT_MAX_RETRY_BACKOFF_MS,
        "30000",
        "Maximum retry delay (ft_max_retry_backoff_ms)",
    ),
    OptionSpec::numeric(
        KEY_FT_TRIM_THRESHOLD_BYTES,
        "33554432",
        "Acknowledged bytes at the head of the disk log before it is compacted (ft_trim_threshold_bytes)",
    ),
    OptionSpec::numeric(
        KEY_FT_STOP_GRACE_MS,
        "5000",
        "Time workers get to finish in-flight sends on shutdown (ft_stop_grace_ms)",
    ),
    OptionSpec::numeric(
        KEY_FLOW_RATE_LIMIT,
        "",
        "Network flow limit in KB/s, unset for unlimited (flow_rate_limit)",
    ),
    OptionSpec::numeric(
        KEY_REQUEST_RATE_LIMIT,
        "",
        "Request limit per second, unset for unlimited (request_rate_limit)",
    ),
];

/// Validates every known key of `options` against `specs`. Keys without a spec are ignored.
pub fn validate_options<'a>(
    specs: impl IntoIterator<Item = &'a OptionSpec>,
    options: &HashMap<String, String>,
) -> Result<(), ConfigError> {
    for spec in specs {
        let value = options.get(spec.key).map_or("", |v| v.trim());
        spec.validate(value)?;
    }
    Ok(())
}

/// Returns the trimmed value of `key`, falling back to the option default.
pub(crate) fn value_or_default<'a>(
    options: &'a HashMap<String, String>,
    spec: &'a OptionSpec,
) -> &'a str {
    match options.get(spec.key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => value,
        _ => spec.default,
    }
}

/// Looks up the `OptionSpec` of a shared fault-tolerance key.
pub(crate) fn ft_spec(key: &str) -> Option<&'static OptionSpec> {
    FT_OPTIONS.iter().find(|spec| spec.key == key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_every_ft_key_is_unique() {
        let mut keys: Vec<&str> = FT_OPTIONS.iter().map(|s| s.key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), FT_OPTIONS.len());
    }

    #[test]
    fn test_defaults_pass_their_own_validation() {
        for spec in FT_OPTIONS {
            assert!(spec.validate(spec.default).is_ok(), "{}", spec.key);
        }
    }

    #[test]
    fn test_numeric_rejects_partial_match() {
        let spec = ft_spec(KEY_FT_PROCS).unwrap();
        assert!(spec.validate("4").is_ok());
        assert!(spec.validate("4x").is_err());
        assert!(spec.validate("-1").is_err());
        assert!(spec.validate("1.5").is_err());
    }

    #[test]
    fn test_choice_rejects_unknown_value() {
        let spec = ft_spec(KEY_FT_STRATEGY).unwrap();
        assert!(spec.validate(STRATEGY_CONCURRENT).is_ok());
        let err = spec.validate("sometimes").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { ref key, .. } if key == KEY_FT_STRATEGY));
    }

    #[test]
    fn test_required_option_must_be_present() {
        let spec = OptionSpec::new("file_send_path", "", "path").required();
        assert_eq!(
            spec.validate(""),
            Err(ConfigError::MissingOption("file_send_path".to_string()))
        );
    }

    #[test]
    fn test_validate_options_ignores_unknown_keys() {
        let opts = options(&[("something_else", "??"), (KEY_FT_SYNC_EVERY, " 5 ")]);
        assert!(validate_options(FT_OPTIONS, &opts).is_ok());
    }

    #[test]
    fn test_value_or_default() {
        let opts = options(&[(KEY_FT_SYNC_EVERY, "   ")]);
        let spec = ft_spec(KEY_FT_SYNC_EVERY).unwrap();
        assert_eq!(value_or_default(&opts, spec), "10");
    }

    #[test]
    fn test_check_pattern_is_compiled_once() {
        let spec = OptionSpec::new("window", "", "window").with_check(r"[a-z]{2}\d");
        assert!(spec.validate("ab1").is_ok());
        assert!(spec.validate("ab12").is_err());

        let cached = CHECK_PATTERNS.get().unwrap().lock().unwrap();
        assert_eq!(cached.get(r"[a-z]{2}\d").unwrap().as_str(), r"^(?:[a-z]{2}\d)$");
        drop(cached);

        let first = check_pattern(r"[a-z]{2}\d").unwrap();
        let second = check_pattern(r"[a-z]{2}\d").unwrap();
        assert_eq!(first.as_str(), second.as_str());
        assert!(spec.validate("zz9").is_ok());
    }

    #[test]
    fn test_bad_check_pattern_is_reported() {
        let spec = OptionSpec::new("broken", "", "broken").with_check("(unclosed");
        let err = spec.validate("x").unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidOption { ref reason, .. } if reason.starts_with("bad check pattern"))
        );
    }

    proptest! {
        #[test]
        fn numeric_options_accept_exactly_digit_strings(value in "\\PC{0,12}") {
            let spec = ft_spec(KEY_FT_WRITE_LIMIT).unwrap();
            let all_digits = !value.is_empty() && value.chars().all(|c| c.is_ascii_digit());
            if value.is_empty() || all_digits {
                prop_assert!(spec.validate(&value).is_ok());
            }
            if !value.is_empty() && !value.chars().all(|c| c.is_numeric()) {
                prop_assert!(spec.validate(&value).is_err());
            }
        }
    }
}
