use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_REGION: &str = "us-east-2";
pub const DEFAULT_TABLE_NAME: &str = "sessions";
pub const DEFAULT_TTL_SECONDS: i64 = 1440;

/// Root configuration for the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub table_region: String,
    pub table_name: String,
    pub default_ttl_seconds: i64,
    pub consistency: ConsistencyMode,
    /// Override for the table endpoint (DynamoDB Local and friends).
    pub endpoint_url: Option<String>,
    pub retry: RetryConfig,
    pub gc: GcConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_region: DEFAULT_REGION.to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            consistency: ConsistencyMode::default(),
            endpoint_url: None,
            retry: RetryConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::Invalid("tableName must not be empty".to_string()));
        }
        if self.table_region.trim().is_empty() {
            return Err(ConfigError::Invalid("tableRegion must not be empty".to_string()));
        }
        if self.default_ttl_seconds <= 0 {
            return Err(ConfigError::Invalid(format!(
                "defaultTtlSeconds must be positive, got {}",
                self.default_ttl_seconds
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.maxAttempts must be at least 1".to_string()));
        }
        if self.gc.interval_seconds == 0 {
            return Err(ConfigError::Invalid("gc.intervalSeconds must be positive".to_string()));
        }
        if self.gc.page_size == 0 {
            return Err(ConfigError::Invalid("gc.pageSize must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    #[default]
    Eventual,
    Strong,
}

impl ConsistencyMode {
    pub fn is_strong(self) -> bool {
        self == ConsistencyMode::Strong
    }
}

impl FromStr for ConsistencyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eventual" => Ok(ConsistencyMode::Eventual),
            "strong" => Ok(ConsistencyMode::Strong),
            other => Err(ConfigError::Invalid(format!(
                "CONSISTENCY_MODE must be eventual or strong, got {other:?}"
            ))),
        }
    }
}

/// Backoff policy for transient backend failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Upper bound of the backoff window before attempt `attempt + 1`.
    pub fn delay_cap(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub page_size: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 600,
            page_size: 100,
        }
    }
}

// ====== Config loading ======

/// Load configuration from the process environment.
///
/// Priority:
/// 1. `DYNASESS_CONFIG` env var, a full JSON config, as the base
/// 2. Individual env vars layered on top
pub fn load_config_from_env() -> Result<StoreConfig, ConfigError> {
    load_config_with(|name| std::env::var(name).ok())
}

/// Same as [`load_config_from_env`] with an injectable variable lookup.
pub fn load_config_with<F>(lookup: F) -> Result<StoreConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match lookup("DYNASESS_CONFIG") {
        Some(json) => serde_json::from_str::<StoreConfig>(&json)?,
        None => StoreConfig::default(),
    };

    // Older deployments only set the PIE_* names.
    if let Some(v) = non_empty(lookup("TABLE_REGION"))
        .or_else(|| non_empty(lookup("PIE_DYNAMODB_SESSION_TABLE_REGION")))
    {
        cfg.table_region = v;
    }
    if let Some(v) = non_empty(lookup("TABLE_NAME"))
        .or_else(|| non_empty(lookup("PIE_DYNAMODB_SESSION_TABLE_NAME")))
    {
        cfg.table_name = v;
    }
    if let Some(v) = non_empty(lookup("DEFAULT_TTL_SECONDS")) {
        cfg.default_ttl_seconds = parse_var("DEFAULT_TTL_SECONDS", &v)?;
    }
    if let Some(v) = non_empty(lookup("CONSISTENCY_MODE")) {
        cfg.consistency = v.parse()?;
    }
    if let Some(v) = non_empty(lookup("TABLE_ENDPOINT_URL")) {
        cfg.endpoint_url = Some(v);
    }

    // Retry
    if let Some(v) = non_empty(lookup("RETRY_MAX_ATTEMPTS")) {
        cfg.retry.max_attempts = parse_var("RETRY_MAX_ATTEMPTS", &v)?;
    }

    // Garbage collection
    if let Some(v) = non_empty(lookup("GC_ENABLED")) {
        cfg.gc.enabled = parse_bool("GC_ENABLED", &v)?;
    }
    if let Some(v) = non_empty(lookup("GC_INTERVAL_SECONDS")) {
        cfg.gc.interval_seconds = parse_var("GC_INTERVAL_SECONDS", &v)?;
    }

    cfg.validate()?;
    Ok(cfg)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name}: cannot parse {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name}: cannot parse {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = load_config_with(env(&[])).unwrap();
        assert_eq!(cfg.table_region, "us-east-2");
        assert_eq!(cfg.table_name, "sessions");
        assert_eq!(cfg.default_ttl_seconds, 1440);
        assert_eq!(cfg.consistency, ConsistencyMode::Eventual);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(!cfg.gc.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = load_config_with(env(&[
            ("TABLE_REGION", "eu-west-1"),
            ("TABLE_NAME", "web-sessions"),
            ("DEFAULT_TTL_SECONDS", "3600"),
            ("CONSISTENCY_MODE", "Strong"),
            ("GC_ENABLED", "true"),
            ("GC_INTERVAL_SECONDS", "30"),
        ]))
        .unwrap();
        assert_eq!(cfg.table_region, "eu-west-1");
        assert_eq!(cfg.table_name, "web-sessions");
        assert_eq!(cfg.default_ttl_seconds, 3600);
        assert!(cfg.consistency.is_strong());
        assert!(cfg.gc.enabled);
        assert_eq!(cfg.gc.interval_seconds, 30);
    }

    #[test]
    fn test_empty_vars_fall_back_to_defaults() {
        let cfg = load_config_with(env(&[("TABLE_NAME", "  "), ("TABLE_REGION", "")])).unwrap();
        assert_eq!(cfg.table_name, "sessions");
        assert_eq!(cfg.table_region, "us-east-2");
    }

    #[test]
    fn test_legacy_table_vars_are_fallbacks() {
        let cfg = load_config_with(env(&[
            ("PIE_DYNAMODB_SESSION_TABLE_REGION", "eu-central-1"),
            ("PIE_DYNAMODB_SESSION_TABLE_NAME", "php-sessions"),
        ]))
        .unwrap();
        assert_eq!(cfg.table_region, "eu-central-1");
        assert_eq!(cfg.table_name, "php-sessions");

        let cfg = load_config_with(env(&[
            ("TABLE_NAME", "web-sessions"),
            ("PIE_DYNAMODB_SESSION_TABLE_NAME", "php-sessions"),
            ("PIE_DYNAMODB_SESSION_TABLE_REGION", "eu-central-1"),
            ("TABLE_REGION", " "),
        ]))
        .unwrap();
        assert_eq!(cfg.table_name, "web-sessions");
        assert_eq!(cfg.table_region, "eu-central-1");
    }

    #[test]
    fn test_json_base_with_env_overlay() {
        let cfg = load_config_with(env(&[
            (
                "DYNASESS_CONFIG",
                r#"{"tableName":"from-json","retry":{"maxAttempts":5},"gc":{"pageSize":25}}"#,
            ),
            ("TABLE_REGION", "ap-northeast-1"),
        ]))
        .unwrap();
        assert_eq!(cfg.table_name, "from-json");
        assert_eq!(cfg.table_region, "ap-northeast-1");
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 50);
        assert_eq!(cfg.gc.page_size, 25);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load_config_with(env(&[("CONSISTENCY_MODE", "linearizable")])).is_err());
        assert!(load_config_with(env(&[("DEFAULT_TTL_SECONDS", "soon")])).is_err());
        assert!(load_config_with(env(&[("DEFAULT_TTL_SECONDS", "0")])).is_err());
        assert!(load_config_with(env(&[("RETRY_MAX_ATTEMPTS", "0")])).is_err());
        assert!(load_config_with(env(&[("GC_ENABLED", "maybe")])).is_err());
        assert!(matches!(
            load_config_with(env(&[("DYNASESS_CONFIG", "{not json")])),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_delay_cap_grows_and_saturates() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_cap(1), Duration::from_millis(50));
        assert_eq!(retry.delay_cap(2), Duration::from_millis(100));
        assert_eq!(retry.delay_cap(3), Duration::from_millis(200));
        assert_eq!(retry.delay_cap(30), Duration::from_millis(1000));
    }
}
