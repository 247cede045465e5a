//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::coordinator::{CoordinatorSettings, TeardownPolicy};
use crate::fixtures::Fixture;
use crate::output::OutputMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of nodes (node 1 is the leader)
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    /// How node output is merged
    #[serde(default)]
    pub output: OutputMode,
    /// How long a follower waits for each leader broadcast
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,
    /// How long the leader waits for followers at the teardown barrier
    #[serde(default = "default_barrier_timeout_ms")]
    pub barrier_timeout_ms: u64,
    /// Upper bound for a whole multi-process run
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default)]
    pub teardown_policy: TeardownPolicy,
    /// Demo suite to run
    #[serde(default)]
    pub fixture: Fixture,
    /// Hub listen port for multi-process runs (0 picks a free port)
    #[serde(default)]
    pub hub_port: u16,
    /// Write the run summary as JSON to this path
    #[serde(default)]
    pub json_output: Option<PathBuf>,
    #[serde(default)]
    pub debug: bool,
}

fn default_nodes() -> u32 {
    1
}

fn default_broadcast_timeout_ms() -> u64 {
    300_000
}

fn default_barrier_timeout_ms() -> u64 {
    30_000
}

fn default_run_timeout_ms() -> u64 {
    600_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            output: OutputMode::default(),
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            barrier_timeout_ms: default_barrier_timeout_ms(),
            run_timeout_ms: default_run_timeout_ms(),
            teardown_policy: TeardownPolicy::default(),
            fixture: Fixture::default(),
            hub_port: 0,
            json_output: None,
            debug: false,
        }
    }
}

impl RunConfig {
    /// Timeouts and policies handed to every node's coordinator
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            broadcast_timeout: Duration::from_millis(self.broadcast_timeout_ms),
            barrier_timeout: Duration::from_millis(self.barrier_timeout_ms),
            teardown_policy: self.teardown_policy,
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}
