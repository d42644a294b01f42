//! Cadence CLI Binary

use anyhow::{anyhow, Context};
use cadence::cli::{map_error, Cli, RunContext};
use cadence::config::ConfigLoader;
use cadence::logging::{init_logging, LoggingConfig};
use clap::Parser;
use std::process;
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("Cadence CLI starting");

    match run(&cli) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("{:#}", e);
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<String> {
    let context = RunContext::new(cli.workspace.clone(), cli.config.clone())
        .map_err(|e| anyhow!(map_error(&e)))
        .context("Error initializing workspace")?;
    context
        .execute(&cli.command)
        .map_err(|e| anyhow!(map_error(&e)))
}

/// Logging configuration from the config file, overridden by CLI flags.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let loaded = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(&cli.workspace),
    };
    let mut config = loaded.map(|c| c.logging).unwrap_or_default();

    if cli.quiet {
        config.enabled = false;
    }
    if cli.verbose {
        config.level = "debug".to_string();
    }
    if let Some(level) = &cli.log_level {
        config.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.format = format.clone();
    }
    if let Some(output) = &cli.log_output {
        config.output = output.clone();
    }
    if let Some(file) = &cli.log_file {
        config.file = file.clone();
    }
    if config.output == "file" && config.file.is_relative() {
        config.file = cli.workspace.join(&config.file);
    }
    config
}
