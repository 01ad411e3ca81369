//! SDK configuration with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SdkConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `BEACON_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub api_base_url: String,
    /// Never written back out.
    #[serde(skip_serializing)]
    pub sdk_key: Option<SecretString>,
    /// SQLite file holding the queue and preferences.
    pub store_path: PathBuf,
    pub retry: RetryPolicy,
    /// Debounce window for queue persistence.
    pub persist_delay_ms: u64,
    pub tracking_disabled: bool,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            api_base_url: beacon_net::DEFAULT_API_URL.to_string(),
            sdk_key: None,
            store_path: data_dir().join("beacon.db"),
            retry: RetryPolicy::default(),
            persist_delay_ms: 500,
            tracking_disabled: false,
        }
    }
}

fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".beacon")
}

/// `~/.beacon/config.json`.
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

pub fn load_config() -> Result<SdkConfig> {
    load_config_from_path(&config_path())
}

/// Load config from a specific path with env var overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_config_from_path(path: &Path) -> Result<SdkConfig> {
    let defaults = serde_json::to_value(SdkConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: SdkConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn validate(config: &SdkConfig) -> Result<()> {
    if !config.api_base_url.starts_with("http://") && !config.api_base_url.starts_with("https://") {
        return Err(SettingsError::InvalidValue(format!(
            "api_base_url must be http(s): {}",
            config.api_base_url
        )));
    }
    if !(0.0..=1.0).contains(&config.retry.jitter_factor) {
        return Err(SettingsError::InvalidValue(format!(
            "retry.jitter_factor out of range: {}",
            config.retry.jitter_factor
        )));
    }
    Ok(())
}

/// Objects merge recursively; arrays and primitives are replaced; nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are logged and ignored.
pub fn apply_env_overrides(config: &mut SdkConfig) {
    if let Some(v) = read_env_string("BEACON_API_URL") {
        config.api_base_url = v;
    }
    if let Some(v) = read_env_string("BEACON_KEY") {
        config.sdk_key = Some(SecretString::from(v));
    }
    if let Some(v) = read_env_string("BEACON_STORE") {
        config.store_path = PathBuf::from(v);
    }
    if let Some(v) = read_env_u32("BEACON_MAX_RETRIES", 1, 100) {
        config.retry.max_retries = v;
    }
    if let Some(v) = read_env_u64("BEACON_RETRY_INTERVAL_MS", 0, 600_000) {
        config.retry.retry_interval_ms = v;
    }
    if let Some(v) = read_env_u64("BEACON_TIMEOUT_MS", 100, 600_000) {
        config.retry.timeout_ms = v;
    }
    if let Some(v) = read_env_bool("BEACON_TRACKING_DISABLED") {
        config.tracking_disabled = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    let val = std::env::var(name).ok()?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use secrecy::ExposeSecret;

    fn temp_file(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("beacon-config-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn merge_nested_override_keeps_siblings() {
        let target = serde_json::json!({"retry": {"max_retries": 3, "timeout_ms": 5500}});
        let source = serde_json::json!({"retry": {"max_retries": 5}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["retry"]["max_retries"], 5);
        assert_eq!(merged["retry"]["timeout_ms"], 5500);
    }

    #[test]
    fn merge_skips_null_and_replaces_arrays() {
        let target = serde_json::json!({"a": 1, "list": [1, 2, 3]});
        let source = serde_json::json!({"a": null, "list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["list"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("beacon-missing-{}.json", uuid::Uuid::now_v7()));
        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.persist_delay_ms, 500);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let path = temp_file(
            r#"{
                "api_base_url": "https://attr.example.test",
                "sdk_key": "key_test_abc",
                "retry": {"max_retries": 5, "backoff": {"kind": "exponential", "max_interval_ms": 8000}},
                "persist_delay_ms": 250
            }"#,
        );
        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.api_base_url, "https://attr.example.test");
        assert_eq!(config.sdk_key.as_ref().map(|k| k.expose_secret().to_string()).as_deref(), Some("key_test_abc"));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.timeout_ms, 5_500);
        assert_eq!(config.retry.backoff, Backoff::Exponential { max_interval_ms: 8_000 });
        assert_eq!(config.persist_delay_ms, 250);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_file("{not json");
        assert!(matches!(load_config_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn non_http_base_url_is_rejected() {
        let path = temp_file(r#"{"api_base_url": "ftp://nope"}"#);
        assert!(matches!(load_config_from_path(&path), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn sdk_key_is_never_serialized() {
        let config = SdkConfig {
            sdk_key: Some(SecretString::from("key_live_secret".to_string())),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("key_live_secret"));
    }

    #[test]
    fn parse_helpers_enforce_ranges() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u32_range("5", 1, 100), Some(5));
        assert_eq!(parse_u32_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
        assert_eq!(parse_u64_range("600001", 0, 600_000), None);
    }
}
