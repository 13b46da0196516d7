//! # Batched Migrations Configuration Validator
//!
//! Command-line tool for validating engine configuration files per environment before an
//! executor is started against them.

use anyhow::Context;
use batched_migrations::config::ConfigManager;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate batched migration engine configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment whose override file is layered over base.toml
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
    /// Load and validate the merged configuration
    Validate,

    /// Print the merged configuration as JSON with credentials masked
    Show,
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

    let result = match cli.command {
        Some(Commands::Show) => show_config(&cli),
        Some(Commands::Validate) | None => validate_config(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<std::sync::Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
        .with_context(|| format!("loading configuration for environment {}", cli.environment))
}

fn validate_config(cli: &Cli) -> anyhow::Result<()> {
    println!("Validating batched migration configuration");
    println!("Environment: {}", cli.environment);
    if let Some(config_dir) = &cli.config_dir {
        println!("Config Directory: {}", config_dir.display());
    }
    println!();

    let manager = match load(cli) {
        Ok(manager) => manager,
        Err(e) => {
            println!("Failed to load configuration: {e:#}");
            return Err(e);
        }
    };
    let config = manager.config();

    println!("Executor:");
    println!("  schema: {}", config.executor.schema);
    println!("  poll interval: {}ms", config.executor.poll_interval_ms);
    println!("  lease: {}s", config.executor.lease_seconds);
    println!("Failure monitor:");
    println!("  minimum jobs: {}", config.failure_monitor.minimum_jobs);
    println!(
        "  maximum failed ratio: {}",
        config.failure_monitor.maximum_failed_ratio
    );
    println!("  window: {:?}", config.failure_monitor.window);
    println!("Optimizer:");
    println!("  enabled: {}", config.optimizer.enabled);
    println!(
        "  batch size bounds: [{}, {}]",
        config.optimizer.min_batch_size, config.optimizer.max_batch_size
    );
    println!("Retry:");
    println!("  max attempts: {}", config.retry.max_attempts);

    println!("\nAll configuration validation checks passed!");
    Ok(())
}

fn show_config(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli)?;
    println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
    Ok(())
}
