//! Configuration module for Permgate
//!
//! This module provides configuration management and loading utilities.

mod config;
mod environment;

pub use config::{
    HttpClientConfig, LoggingConfig, PermissionsConfig, DEFAULT_DEBOUNCE_WAIT_MS, DEFAULT_EVICTION_TTL_MS,
    MAX_DEBOUNCE_WAIT_MS,
};
pub use environment::{EnvVars, EnvironmentOverrides};
