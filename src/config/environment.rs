//! Environment variable integration for Permgate configuration

use crate::config::{HttpClientConfig, PermissionsConfig};
use crate::error::{PermissionError, Result};
use std::env;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Environment variable names used by Permgate
pub struct EnvVars;

impl EnvVars {
    pub const CONFIG_PATH: &'static str = "PERMGATE_CONFIG_PATH";
    pub const ENABLED: &'static str = "PERMGATE_ENABLED";
    pub const DEBOUNCE_MS: &'static str = "PERMGATE_DEBOUNCE_MS";
    pub const EVICTION_TTL_MS: &'static str = "PERMGATE_EVICTION_TTL_MS";
    pub const BASE_URL: &'static str = "PERMGATE_BASE_URL";
    pub const API_TOKEN: &'static str = "PERMGATE_API_TOKEN";
}

/// Environment configuration overrides
#[derive(Debug, Clone, Default)]
pub struct EnvironmentOverrides {
    pub config_path: Option<PathBuf>,
    pub enabled: Option<bool>,
    pub debounce_wait_ms: Option<u64>,
    pub eviction_ttl_ms: Option<u64>,
    pub base_url: Option<String>,
    pub api_token: Option<String>,
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => {
            warn!("Invalid {}: {} (expected: true/false)", name, value);
            Err(PermissionError::config(format!(
                "Invalid {}: {} (valid options: true, false)",
                name, value
            )))
        }
    }
}

fn parse_millis(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| PermissionError::config(format!("Invalid {} environment variable: {}", name, e)))
}

impl EnvironmentOverrides {
    /// Load environment variable overrides
    pub fn load() -> Result<Self> {
        let mut overrides = EnvironmentOverrides::default();

        if let Some(path) = non_empty_var(EnvVars::CONFIG_PATH) {
            debug!("Environment override: {}={}", EnvVars::CONFIG_PATH, path);
            overrides.config_path = Some(PathBuf::from(path));
        }

        if let Some(value) = non_empty_var(EnvVars::ENABLED) {
            overrides.enabled = Some(parse_bool(EnvVars::ENABLED, &value)?);
        }

        if let Some(value) = non_empty_var(EnvVars::DEBOUNCE_MS) {
            overrides.debounce_wait_ms = Some(parse_millis(EnvVars::DEBOUNCE_MS, &value)?);
        }

        if let Some(value) = non_empty_var(EnvVars::EVICTION_TTL_MS) {
            overrides.eviction_ttl_ms = Some(parse_millis(EnvVars::EVICTION_TTL_MS, &value)?);
        }

        overrides.base_url = non_empty_var(EnvVars::BASE_URL);
        overrides.api_token = non_empty_var(EnvVars::API_TOKEN);

        Ok(overrides)
    }

    /// Apply environment overrides to a config
    pub fn apply_to_config(&self, config: &mut PermissionsConfig) {
        if let Some(enabled) = self.enabled {
            if config.enabled != enabled {
                info!("Environment override: enabled changed from {} to {}", config.enabled, enabled);
            }
            config.enabled = enabled;
        }

        if let Some(wait) = self.debounce_wait_ms {
            config.debounce_wait_ms = wait;
        }

        if let Some(ttl) = self.eviction_ttl_ms {
            config.eviction_ttl_ms = ttl;
        }

        if let Some(base_url) = &self.base_url {
            match config.client.as_mut() {
                Some(client) => client.base_url = base_url.clone(),
                None => config.client = Some(HttpClientConfig::new(base_url.clone())),
            }
        }

        // A token without a backend has nothing to authenticate against
        if let (Some(token), Some(client)) = (&self.api_token, config.client.as_mut()) {
            client.api_token = Some(token.clone());
        }
    }

    /// Get the effective config file path (with environment override)
    pub fn get_config_path(&self, default_path: &std::path::Path) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| default_path.to_path_buf())
    }

    /// Check if any environment overrides are active
    pub fn has_overrides(&self) -> bool {
        self.config_path.is_some()
            || self.enabled.is_some()
            || self.debounce_wait_ms.is_some()
            || self.eviction_ttl_ms.is_some()
            || self.base_url.is_some()
            || self.api_token.is_some()
    }

    /// Get summary of active overrides for logging; secrets are masked
    pub fn get_override_summary(&self) -> Vec<String> {
        let mut summary = Vec::new();

        if let Some(ref path) = self.config_path {
            summary.push(format!("{}={:?}", EnvVars::CONFIG_PATH, path));
        }
        if let Some(enabled) = self.enabled {
            summary.push(format!("{}={}", EnvVars::ENABLED, enabled));
        }
        if let Some(wait) = self.debounce_wait_ms {
            summary.push(format!("{}={}", EnvVars::DEBOUNCE_MS, wait));
        }
        if let Some(ttl) = self.eviction_ttl_ms {
            summary.push(format!("{}={}", EnvVars::EVICTION_TTL_MS, ttl));
        }
        if let Some(ref url) = self.base_url {
            summary.push(format!("{}={}", EnvVars::BASE_URL, url));
        }
        if self.api_token.is_some() {
            summary.push(format!("{}=***", EnvVars::API_TOKEN));
        }

        summary
    }
}
