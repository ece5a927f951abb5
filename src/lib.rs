//! Permgate - batched, cached permission checks for interactive clients
//!
//! Many independent components ask "may the current actor do X on Y?".
//! Permgate deduplicates those questions, waits for a short quiet period,
//! sends one request per scope to the authorization backend, and caches the
//! answers for synchronous lookup. Unanswered questions fail open.

pub mod client;
pub mod config;
pub mod error;
pub mod permissions;
pub mod startup;

pub use client::{BatchCheckRequest, BatchCheckResponse, HttpPermissionsClient, PermissionsClient};
pub use config::PermissionsConfig;
pub use error::{PermissionError, Result};
pub use permissions::{
    canonicalize, CanonicalKey, CheckGuard, Permission, PermissionCheck, PermissionsProvider, RegisterOptions,
    ResourceType, Scope,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "permgate.yaml";
