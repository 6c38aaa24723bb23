//! Configuration management for Courier.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default webhook receiver.
pub const DEFAULT_ENDPOINT_URL: &str = "http://127.0.0.1:8080/webhooks";

/// Upper bound on persisted redelivery attempts per webhook event.
pub const MAX_REDELIVERY_RETRIES: u32 = 10;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// URL every webhook event is POSTed to.
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    /// Delivery worker settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Outbound request rate ceilings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// In-process retries around a single transport call.
    #[serde(default = "RetryPolicyConfig::inline_default")]
    pub inline_retry: RetryPolicyConfig,
    /// Persisted redelivery schedule across claims and restarts.
    #[serde(default = "RetryPolicyConfig::redelivery_default")]
    pub redelivery: RetryPolicyConfig,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_endpoint_url() -> String {
    DEFAULT_ENDPOINT_URL.to_string()
}

/// Delivery worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// How often the worker looks for due events.
    pub poll_interval_ms: u64,
    /// Maximum events claimed per poll.
    pub claim_batch_size: usize,
    /// Per-request timeout for the HTTP transport.
    pub request_timeout_secs: u64,
    /// PROCESSING claims untouched for this long are returned to PENDING.
    pub stale_claim_timeout_secs: u64,
    /// Soft-deleted events older than this are purged.
    pub retention_days: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            claim_batch_size: 10,
            request_timeout_secs: 30,
            stale_claim_timeout_secs: 300,
            retention_days: 30,
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stale_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_claim_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

/// Outbound request rate ceilings. Both levels must admit a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 300,
        }
    }
}

/// Serializable retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter_ms: u64,
}

impl RetryPolicyConfig {
    /// Short, in-process retries around one transport call.
    pub fn inline_default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_ms: 250,
        }
    }

    /// Long-lived redelivery schedule (2s, 4s, 8s, ... capped at 5 minutes).
    pub fn redelivery_default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 2_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter_ms: 1_000,
        }
    }

    fn validate(&self, name: &str) -> CoreResult<()> {
        if self.initial_delay_ms == 0 {
            return Err(CoreError::Config(format!(
                "{name}.initial_delay_ms must be greater than zero"
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(CoreError::Config(format!(
                "{name}.max_delay_ms must be >= initial_delay_ms"
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier <= 1.0 {
            return Err(CoreError::Config(format!(
                "{name}.backoff_multiplier must be greater than 1.0"
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            endpoint_url: default_endpoint_url(),
            delivery: DeliveryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            inline_retry: RetryPolicyConfig::inline_default(),
            redelivery: RetryPolicyConfig::redelivery_default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("COURIER_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(endpoint_url) = std::env::var("COURIER_ENDPOINT_URL") {
            self.endpoint_url = endpoint_url;
        }
    }

    /// Check bounds that serde cannot express.
    pub fn validate(&self) -> CoreResult<()> {
        self.endpoint_url()?;

        if self.rate_limit.per_second == 0 || self.rate_limit.per_minute == 0 {
            return Err(CoreError::Config(
                "rate_limit ceilings must be greater than zero".to_string(),
            ));
        }
        if self.delivery.poll_interval_ms == 0 {
            return Err(CoreError::Config(
                "delivery.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.delivery.claim_batch_size == 0 {
            return Err(CoreError::Config(
                "delivery.claim_batch_size must be greater than zero".to_string(),
            ));
        }

        self.inline_retry.validate("inline_retry")?;
        self.redelivery.validate("redelivery")?;
        if self.redelivery.max_retries > MAX_REDELIVERY_RETRIES {
            return Err(CoreError::Config(format!(
                "redelivery.max_retries must be at most {MAX_REDELIVERY_RETRIES}"
            )));
        }

        Ok(())
    }

    /// Get the endpoint URL as a parsed URL.
    pub fn endpoint_url(&self) -> CoreResult<Url> {
        Url::parse(&self.endpoint_url).map_err(CoreError::from)
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::inline_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.endpoint_url, DEFAULT_ENDPOINT_URL);
        assert_eq!(config.rate_limit.per_second, 10);
        assert_eq!(config.rate_limit.per_minute, 300);
        assert_eq!(config.redelivery.max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_from_partial_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "rate_limit": { "per_second": 2 },
            "redelivery": {
                "max_retries": 3,
                "initial_delay_ms": 1000,
                "max_delay_ms": 60000,
                "backoff_multiplier": 3.0
            }
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.rate_limit.per_second, 2);
        assert_eq!(config.rate_limit.per_minute, 300);
        assert_eq!(config.redelivery.max_retries, 3);
        assert_eq!(config.redelivery.jitter_ms, 0);
        assert_eq!(config.inline_retry, RetryPolicyConfig::inline_default());
        assert_eq!(config.delivery.poll_interval_ms, 1000);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.delivery.claim_batch_size = 25;
        config.endpoint_url = "https://hooks.example.com/in".to_string();
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded.delivery.claim_batch_size, 25);
        assert_eq!(loaded.endpoint_url, "https://hooks.example.com/in");
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.delivery.claim_batch_size, 10);
    }

    #[test]
    fn test_config_rejects_invalid_url() {
        let mut config = Config::default();
        config.endpoint_url = "not a valid url".to_string();
        assert!(matches!(config.validate(), Err(CoreError::InvalidUrl(_))));
    }

    #[test]
    fn test_config_rejects_excessive_redelivery_retries() {
        let mut config = Config::default();
        config.redelivery.max_retries = MAX_REDELIVERY_RETRIES + 1;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_config_rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.delivery.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        config.delivery.poll_interval_ms = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_non_growing_backoff() {
        let mut config = Config::default();
        config.inline_retry.backoff_multiplier = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.inline_retry.max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delivery_durations() {
        let delivery = DeliveryConfig::default();
        assert_eq!(delivery.poll_interval(), Duration::from_secs(1));
        assert_eq!(delivery.request_timeout(), Duration::from_secs(30));
        assert_eq!(delivery.retention(), Duration::from_secs(30 * 86_400));
    }
}
