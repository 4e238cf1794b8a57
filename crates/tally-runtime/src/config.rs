//! Runtime configuration.
//!
//! All values are tunable and every field has a default, so an empty YAML
//! document is a valid configuration. Durations are written in human form
//! (`"60s"`, `"2m"`, `"90days"`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tally_core::PlanDefaults;
use thiserror::Error;

use crate::resilience::{BackoffConfig, CircuitBreakerConfig, LimiterConfig};

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing component: {0}")]
    MissingComponent(&'static str),
}

/// Serde adapter for `humantime` durations.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// Transaction coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Window in which a repeated request id is a duplicate
    #[serde(with = "duration_str")]
    pub dedup_window: Duration,

    /// Bound on the dedup check plus atomic write
    #[serde(with = "duration_str")]
    pub write_timeout: Duration,

    /// Reject debits larger than the account total
    pub enforce_sufficiency: bool,

    /// Capacity of the recent-request cache in front of the dedup query
    pub recent_request_capacity: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(60),
            write_timeout: Duration::from_secs(5),
            enforce_sufficiency: true,
            recent_request_capacity: 100_000,
        }
    }
}

/// Retention and audit settings for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Entries older than this are eligible for cleanup
    #[serde(with = "duration_str")]
    pub window: Duration,

    /// Maximum entries deleted per store call
    pub batch_size: usize,

    /// Accounts reconciled concurrently during a bulk run
    pub reconcile_concurrency: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(90 * 24 * 60 * 60),
            batch_size: 500,
            reconcile_concurrency: 8,
        }
    }
}

/// Complete ledger runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub limiter: LimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub backoff: BackoffConfig,
    pub plan: PlanDefaults,
    pub coordinator: CoordinatorConfig,
    pub retention: RetentionConfig,
}

impl LedgerConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject configurations that would make a guard reject everything
    /// or never expire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limiter = &self.limiter;
        let positive_counts = [
            ("limiter.preview_per_minute", limiter.preview_per_minute),
            ("limiter.preview_per_hour", limiter.preview_per_hour),
            ("limiter.session_max_requests", limiter.session_max_requests),
            ("limiter.resource_per_hour", limiter.resource_per_hour),
            ("circuit_breaker.failure_threshold", self.circuit_breaker.failure_threshold),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }

        let positive_durations = [
            ("limiter.short_window", limiter.short_window),
            ("limiter.long_window", limiter.long_window),
            ("limiter.session_length", limiter.session_length),
            ("circuit_breaker.cooldown", self.circuit_breaker.cooldown),
            ("backoff.duration", self.backoff.duration),
            ("coordinator.dedup_window", self.coordinator.dedup_window),
            ("coordinator.write_timeout", self.coordinator.write_timeout),
            ("retention.window", self.retention.window),
        ];
        for (name, value) in positive_durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        if limiter.short_window > limiter.long_window {
            return Err(ConfigError::Invalid(
                "limiter.short_window must not exceed limiter.long_window".to_string(),
            ));
        }
        if self.retention.batch_size == 0 || self.retention.reconcile_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "retention.batch_size and retention.reconcile_concurrency must be positive"
                    .to_string(),
            ));
        }
        if self.retention.window <= self.coordinator.dedup_window {
            return Err(ConfigError::Invalid(
                "retention.window must be longer than coordinator.dedup_window".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = LedgerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.coordinator.dedup_window, Duration::from_secs(60));
        assert_eq!(config.limiter.preview_per_minute, 10);
        assert_eq!(config.plan.free_actions, 20);
        assert_eq!(config.retention.window, Duration::from_secs(90 * 86_400));
    }

    #[test]
    fn test_human_durations() {
        let yaml = r#"
limiter:
  preview_per_minute: 5
  ingest_min_interval: "2m"
circuit_breaker:
  failure_threshold: 4
  cooldown: "30s"
backoff:
  duration: "1h"
retention:
  window: "30days"
"#;
        let config = LedgerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.preview_per_minute, 5);
        assert_eq!(config.limiter.ingest_min_interval, Duration::from_secs(120));
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(30));
        assert_eq!(config.backoff.duration, Duration::from_secs(3600));
        assert_eq!(config.retention.window, Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let yaml = "circuit_breaker:\n  failure_threshold: 0\n";
        let err = LedgerConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_duration() {
        let yaml = "coordinator:\n  dedup_window: \"soon\"\n";
        assert!(matches!(
            LedgerConfig::from_yaml(yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip_keeps_durations() {
        let config = LedgerConfig::default();
        let yaml = config.to_yaml().unwrap();
        let back = LedgerConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.coordinator.write_timeout, config.coordinator.write_timeout);
        assert_eq!(back.limiter.session_length, config.limiter.session_length);
    }
}
