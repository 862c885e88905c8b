//! huginn-config - print the effective huginn configuration.
//!
//! Loads the configuration the same way a library consumer would, applies
//! an optional override file, validates the result and prints it as JSON.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use huginn::config::MonitorOverrides;
use huginn::{ConfigOverrides, Environment, HuginnConfig, HuginnError};

/// Huginn configuration inspector
#[derive(Parser)]
#[command(name = "huginn-config")]
#[command(version = huginn::PKG_VERSION)]
#[command(about = "Print the effective huginn configuration as JSON")]
struct Args {
    /// Path to configuration file (default: ~/.huginn/config.toml, then /etc/huginn/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TOML file with partial overrides applied on top of the configuration.
    #[arg(short, long)]
    overrides: Option<PathBuf>,

    /// Apply the environment's default sampling rate (development or production).
    #[arg(short, long, env = "HUGINN_ENV")]
    env: Option<String>,

    /// Print compact JSON instead of pretty JSON.
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = HuginnConfig::load(args.config.as_deref())?;

    if let Some(env) = args.env.as_deref() {
        let env = Environment::parse(env);
        let environment = ConfigOverrides {
            monitor: MonitorOverrides {
                sampling_rate: Some(env.default_sampling_rate()),
                ..Default::default()
            },
            ..Default::default()
        };
        config = config.merge(&environment);
        tracing::debug!(?env, "applied environment defaults");
    }

    if let Some(path) = &args.overrides {
        let content = fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read overrides file {path:?}: {e}"))
        })?;
        config = config.merge(&ConfigOverrides::from_toml_str(&content)?);
    }

    config.validate()?;

    let json = if args.compact {
        serde_json::to_string(&config)?
    } else {
        serde_json::to_string_pretty(&config)?
    };
    println!("{json}");
    Ok(())
}
