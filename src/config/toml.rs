//! TOML configuration file parsing

use super::cli_convert::*;
use super::RunConfig;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<RunConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<RunConfig> {
    let config: RunConfig = ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: RunConfig) -> Result<RunConfig> {
    if let Some(nodes) = cli.nodes {
        config.nodes = nodes;
    }

    if cli.stream {
        config.output = convert_output_mode(true);
    }

    if let Some(fixture) = cli.fixture {
        config.fixture = convert_fixture(fixture);
    }

    if let Some(ref timeout) = cli.broadcast_timeout {
        config.broadcast_timeout_ms = parse_duration_ms(timeout).context("Invalid broadcast timeout")?;
    }
    if let Some(ref timeout) = cli.barrier_timeout {
        config.barrier_timeout_ms = parse_duration_ms(timeout).context("Invalid barrier timeout")?;
    }
    if let Some(ref timeout) = cli.run_timeout {
        config.run_timeout_ms = parse_duration_ms(timeout).context("Invalid run timeout")?;
    }

    if let Some(policy) = cli.teardown_policy {
        config.teardown_policy = convert_teardown_policy(policy);
    }

    if let Some(port) = cli.hub_port {
        config.hub_port = port;
    }

    if let Some(ref path) = cli.json_output {
        config.json_output = Some(path.clone());
    }

    if cli.debug {
        config.debug = true;
    }

    Ok(config)
}

/// Build the effective configuration: config file (if any), then CLI overrides
pub fn build_config(cli: &Cli) -> Result<RunConfig> {
    let base = match cli.config {
        Some(ref path) => parse_toml_file(path)?,
        None => RunConfig::default(),
    };
    merge_cli_with_config(cli, base)
}
