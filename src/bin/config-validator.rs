//! # RelVal Configuration Validator
//!
//! Command-line tool for validating the RelVal core configuration across
//! environments. Catches configuration issues before the orchestration core is
//! started against real services.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relval_core::config::{ConfigManager, RelvalConfig, ENVIRONMENT_SECTIONS};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "relval-config-validator")]
#[command(about = "Validate RelVal core configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every environment
    All,

    /// Print the effective configuration with sensitive values masked
    Show,

    /// List available environments
    Environments,

    /// Show values that differ between two environments
    Compare {
        #[arg(short, long, default_value = "development")]
        base: String,

        #[arg(short, long)]
        target: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) => validate_all_environments(&cli),
        Some(Commands::Show) => show_config(&cli),
        Some(Commands::Environments) => list_environments(),
        Some(Commands::Compare { base, target }) => compare_configs(&cli, base, target),
        None => validate_environment(&cli, &cli.environment).map(|_| ()),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> Result<std::sync::Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)
        .with_context(|| format!("loading configuration for '{environment}'"))
}

fn validate_environment(cli: &Cli, environment: &str) -> Result<RelvalConfig> {
    println!("🔧 Validating RelVal configuration for '{environment}'");
    let manager = load(cli, environment)?;
    println!(
        "✅ Loaded from {}",
        manager.config_directory().display()
    );
    let config = manager.config().clone();
    check_collaborators(&config)?;
    println!("✅ '{environment}' passed all checks");
    Ok(config)
}

/// Checks beyond structural validation that would only fail at runtime
fn check_collaborators(config: &RelvalConfig) -> Result<()> {
    for (name, url) in [
        ("batch_service.base_url", &config.batch_service.base_url),
        ("tracker.base_url", &config.tracker.base_url),
        ("dataset_catalog.base_url", &config.dataset_catalog.base_url),
        ("batch_service.config_cache_url", &config.batch_service.config_cache_url),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("{name} must be an http(s) URL, got '{url}'");
        }
    }
    if config.remote.host.trim().is_empty() {
        bail!("remote.host must not be empty");
    }
    if config.remote.workspace_path.trim().is_empty() {
        bail!("remote.workspace_path must not be empty");
    }
    println!(
        "   remote: {}@{} ({} workers, approve delay {:?})",
        config.remote.username,
        config.remote.host,
        config.submission.workers,
        config.batch_service.approve_delay()
    );
    Ok(())
}

fn validate_all_environments(cli: &Cli) -> Result<()> {
    let mut failed = Vec::new();
    for environment in ENVIRONMENT_SECTIONS {
        if let Err(e) = validate_environment(cli, environment) {
            println!("❌ {environment}: {e:#}");
            failed.push(environment);
        }
        println!();
    }
    if !failed.is_empty() {
        bail!("invalid environments: {}", failed.join(", "));
    }
    println!("🎉 All environments passed");
    Ok(())
}

fn show_config(cli: &Cli) -> Result<()> {
    let manager = load(cli, &cli.environment)?;
    println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
    Ok(())
}

fn list_environments() -> Result<()> {
    println!("📋 Available Environments:");
    for environment in ENVIRONMENT_SECTIONS {
        println!("  • {environment}");
    }
    Ok(())
}

fn compare_configs(cli: &Cli, base: &str, target: &str) -> Result<()> {
    println!("🔍 Comparing Configurations: {base} vs {target}");
    let base_values = flatten(&load(cli, base)?.debug_config());
    let target_values = flatten(&load(cli, target)?.debug_config());

    let mut differences = 0;
    for (path, base_value) in &base_values {
        let target_value = target_values
            .iter()
            .find(|(other, _)| other == path)
            .map(|(_, value)| value);
        if path == "environment" || target_value == Some(base_value) {
            continue;
        }
        differences += 1;
        println!(
            "  {path}: {base_value} → {}",
            target_value.map_or("<missing>".to_string(), ToString::to_string)
        );
    }
    if differences == 0 {
        println!("  no differences");
    }
    Ok(())
}

/// Leaf values keyed by dotted path
fn flatten(value: &Value) -> Vec<(String, Value)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, child, out);
                }
            }
            leaf => out.push((prefix.to_string(), leaf.clone())),
        }
    }
    let mut out = Vec::new();
    walk("", value, &mut out);
    out
}
