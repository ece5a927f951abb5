//! Configuration types for Permgate

use crate::config::environment::EnvironmentOverrides;
use crate::error::{PermissionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default debounce window
pub const DEFAULT_DEBOUNCE_WAIT_MS: u64 = 300;

/// Default grace period before an unreferenced entry is evicted
pub const DEFAULT_EVICTION_TTL_MS: u64 = 5_000;

/// Upper bound for the debounce window; longer waits would visibly delay UI
pub const MAX_DEBOUNCE_WAIT_MS: u64 = 10_000;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Global toggle; when `false` every check evaluates to `true` and nothing is fetched
    pub enabled: bool,
    /// Quiet period before pending checks are flushed
    pub debounce_wait_ms: u64,
    /// How long an unreferenced entry is kept before eviction
    pub eviction_ttl_ms: u64,
    /// Backend connection, required by the CLI's `check` command
    pub client: Option<HttpClientConfig>,
    /// Logging configuration
    pub logging: Option<LoggingConfig>,
}

/// Connection settings for the HTTP permissions backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Transport timeout; unset means the call waits indefinitely
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(PermissionError::config(format!(
                    "Invalid log level '{}' (valid options: trace, debug, info, warn, error)",
                    other
                )))
            }
        }
        match self.format.to_lowercase().as_str() {
            "text" | "json" => Ok(()),
            other => Err(PermissionError::config(format!(
                "Invalid log format '{}' (valid options: text, json)",
                other
            ))),
        }
    }
}

impl HttpClientConfig {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            request_timeout_ms: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| PermissionError::config(format!("Invalid client.base_url '{}': {}", self.base_url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(PermissionError::config(format!(
                "client.base_url must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(PermissionError::config("client.request_timeout_ms cannot be zero"));
        }
        Ok(())
    }
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_wait_ms: DEFAULT_DEBOUNCE_WAIT_MS,
            eviction_ttl_ms: DEFAULT_EVICTION_TTL_MS,
            client: None,
            logging: Some(LoggingConfig::default()),
        }
    }
}

impl PermissionsConfig {
    pub fn debounce_wait(&self) -> Duration {
        Duration::from_millis(self.debounce_wait_ms)
    }

    pub fn eviction_ttl(&self) -> Duration {
        Duration::from_millis(self.eviction_ttl_ms)
    }

    /// Builder-style override of the debounce window
    pub fn with_debounce_wait(mut self, wait: Duration) -> Self {
        self.debounce_wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Builder-style override of the eviction grace period
    pub fn with_eviction_ttl(mut self, ttl: Duration) -> Self {
        self.eviction_ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce_wait_ms == 0 {
            return Err(PermissionError::config("debounce_wait_ms cannot be zero"));
        }
        if self.debounce_wait_ms > MAX_DEBOUNCE_WAIT_MS {
            return Err(PermissionError::config(format!(
                "debounce_wait_ms ({}) exceeds maximum ({})",
                self.debounce_wait_ms, MAX_DEBOUNCE_WAIT_MS
            )));
        }
        if self.eviction_ttl_ms == 0 {
            return Err(PermissionError::config("eviction_ttl_ms cannot be zero"));
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }
        if let Some(logging) = &self.logging {
            logging.validate()?;
        }
        Ok(())
    }

    /// Load .env files in order of precedence
    fn load_env_files() {
        let env = std::env::var("PERMGATE_ENV")
            .or_else(|_| std::env::var("ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let env_specific_file = format!(".env.{}", env);
        let env_files = [".env", env_specific_file.as_str(), ".env.local"];

        for env_file in env_files {
            match dotenvy::from_filename(env_file) {
                Ok(_) => {
                    tracing::info!("Loaded environment variables from {}", env_file);
                }
                Err(e) if e.not_found() => {
                    tracing::debug!("No {} file found, skipping", env_file);
                }
                Err(e) => {
                    tracing::warn!("Failed to load {}: {}", env_file, e);
                }
            }
        }
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| PermissionError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Load configuration from file, then apply environment overrides and validate.
    ///
    /// Precedence: defaults < file < environment. A missing file is not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_env_files();

        let mut config = if path.as_ref().exists() {
            let content = std::fs::read_to_string(&path)?;
            Self::from_yaml(&content)?
        } else {
            tracing::warn!("Config file {:?} not found, using defaults", path.as_ref());
            Self::default()
        };

        EnvironmentOverrides::load()?.apply_to_config(&mut config);

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PermissionsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.debounce_wait(), Duration::from_millis(300));
        assert_eq!(config.eviction_ttl(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = PermissionsConfig::from_yaml("debounce_wait_ms: 50\n").unwrap();
        assert_eq!(config.debounce_wait_ms, 50);
        assert_eq!(config.eviction_ttl_ms, DEFAULT_EVICTION_TTL_MS);
        assert!(config.enabled);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let config = PermissionsConfig::default()
            .with_debounce_wait(Duration::MAX)
            .with_eviction_ttl(Duration::MAX);
        assert_eq!(config.debounce_wait_ms, u64::MAX);
        assert_eq!(config.eviction_ttl_ms, u64::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(PermissionsConfig::default().with_debounce_wait(Duration::ZERO).validate().is_err());
        assert!(PermissionsConfig::default()
            .with_debounce_wait(Duration::from_secs(60))
            .validate()
            .is_err());
        assert!(PermissionsConfig::default().with_eviction_ttl(Duration::ZERO).validate().is_err());

        let mut config = PermissionsConfig::default();
        config.client = Some(HttpClientConfig::new("not a url"));
        assert!(config.validate().is_err());

        config.client = Some(HttpClientConfig::new("ftp://authz.internal"));
        assert!(config.validate().is_err());

        let mut config = PermissionsConfig::default();
        config.logging = Some(LoggingConfig {
            level: "loud".to_string(),
            format: "text".to_string(),
        });
        assert!(config.validate().is_err());
    }
}
