//! Controller Configuration
//!
//! Loaded from a YAML file mounted into the controller pod. Every section has
//! defaults so an absent or partial file still yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace to watch; all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Requeue backoff applied after a failed reconcile
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Health endpoint server
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Exponential requeue backoff
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(default = "default_backoff_base")]
    pub base_seconds: u64,

    /// Upper bound on the delay
    #[serde(default = "default_backoff_max")]
    pub max_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_backoff_base(),
            max_seconds: default_backoff_max(),
        }
    }
}

impl BackoffConfig {
    /// Delay before the next attempt after `failures` consecutive failures (1-based)
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let seconds = self
            .base_seconds
            .checked_mul(1_u64 << exponent)
            .unwrap_or(self.max_seconds)
            .min(self.max_seconds);
        Duration::from_secs(seconds)
    }
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address for the `/health` and `/ready` endpoints
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.backoff.base_seconds == 0 {
            return Err(anyhow::anyhow!("backoff.baseSeconds must be greater than zero"));
        }
        if self.backoff.base_seconds > self.backoff.max_seconds {
            return Err(anyhow::anyhow!(
                "backoff.baseSeconds ({}) must not exceed backoff.maxSeconds ({})",
                self.backoff.base_seconds,
                self.backoff.max_seconds
            ));
        }
        if self
            .server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(anyhow::anyhow!(
                "server.bindAddress '{}' is not a valid socket address",
                self.server.bind_address
            ));
        }
        if matches!(self.namespace.as_deref(), Some(ns) if ns.trim().is_empty()) {
            return Err(anyhow::anyhow!("namespace must not be blank when set"));
        }
        Ok(())
    }

    /// Load configuration from mounted YAML file
    pub fn from_mounted_file(config_path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let config_path = config_path.as_ref();
        let config_str = std::fs::read_to_string(config_path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {e}", config_path.display())
        })?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.namespace, None);
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let config = ControllerConfig::from_yaml(
            r"
namespace: storage
backoff:
  maxSeconds: 60
logging:
  format: json
",
        )
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("storage"));
        assert_eq!(config.backoff.base_seconds, 5);
        assert_eq!(config.backoff.max_seconds, 60);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut config = ControllerConfig::default();
        config.backoff.base_seconds = 600;
        assert!(config.validate().is_err());

        config.backoff.base_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_bind_address() {
        let mut config = ControllerConfig::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let backoff = BackoffConfig {
            base_seconds: 5,
            max_seconds: 60,
        };

        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(40));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ControllerConfig::from_mounted_file("/nonexistent/config.yaml").is_err());
    }
}
