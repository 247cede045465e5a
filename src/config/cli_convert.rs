//! CLI to config conversion utilities

use crate::config::cli;
use crate::coordinator::TeardownPolicy;
use crate::fixtures::Fixture;
use crate::output::OutputMode;
use anyhow::{Context, Result};

/// Parse a duration string (e.g., "500ms", "30s", "5m") to milliseconds
///
/// A bare number is taken as seconds.
pub fn parse_duration_ms(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix("sec").or_else(|| s.strip_suffix('s')) {
        (n, 1000)
    } else if let Some(n) = s.strip_suffix("min").or_else(|| s.strip_suffix('m')) {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s.as_str(), 1000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Duration out of range: {}", s))
}

/// Convert CLI Fixture to the fixtures Fixture
pub fn convert_fixture(cli_fixture: cli::Fixture) -> Fixture {
    match cli_fixture {
        cli::Fixture::Passing => Fixture::Passing,
        cli::Fixture::FailingBeforeSuite => Fixture::FailingBeforeSuite,
        cli::Fixture::FailingAfterSuite => Fixture::FailingAfterSuite,
        cli::Fixture::Compound => Fixture::Compound,
    }
}

/// Convert CLI TeardownPolicy to the coordinator TeardownPolicy
pub fn convert_teardown_policy(cli_policy: cli::TeardownPolicy) -> TeardownPolicy {
    match cli_policy {
        cli::TeardownPolicy::Continue => TeardownPolicy::Continue,
        cli::TeardownPolicy::Stop => TeardownPolicy::Stop,
    }
}

/// Output mode selected by the `--stream` flag
pub fn convert_output_mode(stream: bool) -> OutputMode {
    if stream {
        OutputMode::Streamed
    } else {
        OutputMode::Batched
    }
}
