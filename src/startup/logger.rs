//! Logging setup and startup information

use crate::config::{EnvironmentOverrides, PermissionsConfig};
use crate::error::{PermissionError, Result};
use tracing::info;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `level` when set. Logs go to stderr so stdout stays
/// free for command output.
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    result.map_err(|e| PermissionError::config(format!("Failed to initialize logging: {}", e)))
}

/// Startup logger for configuration summaries
pub struct StartupLogger;

impl StartupLogger {
    /// Log the effective configuration and where it came from
    pub fn display_startup_info(config: &PermissionsConfig, version: &str, overrides: &EnvironmentOverrides) {
        info!("permgate v{} starting", version);
        info!(
            "Permission checks: {}",
            if config.enabled { "enabled" } else { "disabled (all checks granted)" }
        );
        info!("Debounce window: {}ms", config.debounce_wait_ms);
        info!("Eviction grace period: {}ms", config.eviction_ttl_ms);

        match &config.client {
            Some(client) => info!(
                "Backend: {} (auth: {})",
                client.base_url,
                if client.api_token.is_some() { "bearer" } else { "none" }
            ),
            None => info!("Backend: not configured"),
        }

        if overrides.has_overrides() {
            info!("Environment overrides:");
            for line in overrides.get_override_summary() {
                info!("   {}", line);
            }
        }
    }
}
