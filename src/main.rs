use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use permgate::config::{EnvironmentOverrides, PermissionsConfig};
use permgate::permissions::{canonicalize, PermissionCheck, PermissionsProvider, RegisterOptions};
use permgate::startup::{init_logging, StartupLogger};
use permgate::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a list of permission checks against the backend
    Check {
        /// JSON or YAML file with an array of checks, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Give up waiting after this many milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// Override the configured debounce window
        #[arg(long)]
        debounce_ms: Option<u64>,
    },
    /// Load and validate the configuration, then print it
    ValidateConfig,
    /// Print the canonical cache key of each check
    Canonicalize {
        /// JSON or YAML file with an array of checks, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = EnvironmentOverrides::load()?;
    let config_path = overrides.get_config_path(&cli.config);
    let config = PermissionsConfig::load(&config_path).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    let logging = config.logging.clone().unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, cli.json_logs || logging.format.eq_ignore_ascii_case("json"))?;
    debug!("Loaded configuration from {:?}", config_path);

    match cli.command {
        Commands::Check {
            input,
            timeout_ms,
            debounce_ms,
        } => {
            StartupLogger::display_startup_info(&config, env!("CARGO_PKG_VERSION"), &overrides);
            run_check(config, &input, Duration::from_millis(timeout_ms), debounce_ms).await
        }
        Commands::ValidateConfig => {
            StartupLogger::display_startup_info(&config, env!("CARGO_PKG_VERSION"), &overrides);
            println!("{}", serde_yaml::to_string(&config)?);
            info!("Configuration is valid");
            Ok(())
        }
        Commands::Canonicalize { input } => {
            let checks = read_checks(&input)?;
            let keys: Vec<_> = checks
                .iter()
                .map(|check| json!({ "check": check, "key": canonicalize(check).as_str() }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&keys)?);
            Ok(())
        }
    }
}

async fn run_check(config: PermissionsConfig, input: &str, timeout: Duration, debounce_ms: Option<u64>) -> Result<()> {
    let checks = read_checks(input)?;
    let provider = PermissionsProvider::from_config(config)?;
    provider.init()?;

    let mut options = RegisterOptions::new();
    if let Some(ms) = debounce_ms {
        options = options.with_debounce_wait(Duration::from_millis(ms));
    }

    let guard = provider.scoped(&checks, &options);
    let answers = match tokio::time::timeout(timeout, guard.wait_for_resolution()).await {
        Ok(answers) => answers,
        Err(_) => {
            error!("Timed out after {:?} waiting for permission results", timeout);
            guard.evaluate_all()
        }
    };

    let report: Vec<_> = checks
        .iter()
        .zip(&answers)
        .map(|(check, granted)| json!({ "check": check, "granted": granted }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);

    let stats = provider.stats();
    info!(
        "Dispatched {} batch(es) for {} key(s); {} transport failure(s), {} fail-open answer(s)",
        stats.batches_dispatched, stats.keys_dispatched, stats.transport_failures, stats.fail_open_resolutions
    );

    drop(guard);
    provider.dispose();
    Ok(())
}

fn read_checks(input: &str) -> Result<Vec<PermissionCheck>> {
    let content = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read checks from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(Path::new(input)).with_context(|| format!("Failed to read {}", input))?
    };

    // YAML is a superset of JSON, so one parser covers both
    let checks: Vec<PermissionCheck> =
        serde_yaml::from_str(&content).with_context(|| format!("Invalid permission checks in {}", input))?;
    Ok(checks)
}
