//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Run mode (default) - launch every node and aggregate their output
    Run,
    /// Node mode - run one node against a hub
    Node,
    /// Hub mode - relay for nodes started elsewhere
    Hub,
}

/// Demo suite to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Fixture {
    Passing,
    FailingBeforeSuite,
    FailingAfterSuite,
    Compound,
}

/// Teardown failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TeardownPolicy {
    /// Keep running later steps unless they depend on the failed one
    Continue,
    /// Skip the remaining per-node steps
    Stop,
}

/// suitesync - parallel suite coordinator
#[derive(Parser, Debug)]
#[command(name = "suitesync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: run, node, or hub
    #[arg(long, value_enum, default_value = "run")]
    pub mode: ExecutionMode,

    /// TOML configuration file (CLI flags take precedence)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Number of nodes
    #[arg(short = 'n', long, env = "SUITESYNC_NODES")]
    pub nodes: Option<u32>,

    /// Stream output as it arrives instead of batching it per node
    #[arg(long)]
    pub stream: bool,

    /// Demo suite to run
    #[arg(long, value_enum)]
    pub fixture: Option<Fixture>,

    /// How long followers wait for a leader broadcast (e.g., 500ms, 30s, 5m)
    #[arg(long)]
    pub broadcast_timeout: Option<String>,

    /// How long the leader waits for followers to finish teardown (e.g., 30s)
    #[arg(long)]
    pub barrier_timeout: Option<String>,

    /// Upper bound for a whole multi-process run (e.g., 10m)
    #[arg(long)]
    pub run_timeout: Option<String>,

    /// What happens to later teardown steps after one fails
    #[arg(long, value_enum)]
    pub teardown_policy: Option<TeardownPolicy>,

    /// This node's id (node mode only)
    #[arg(long)]
    pub node_id: Option<u32>,

    /// Hub address to connect to (node mode only)
    #[arg(long)]
    pub hub: Option<String>,

    /// Port the hub listens on (run and hub modes, 0 picks a free port)
    #[arg(long)]
    pub hub_port: Option<u16>,

    /// Run every node as a task in this process instead of one process per node
    #[arg(long)]
    pub in_process: bool,

    /// Write the run summary as JSON
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Verbose diagnostics on stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mode == ExecutionMode::Node {
            if self.node_id.is_none() {
                anyhow::bail!("--node-id is required in node mode");
            }
            if self.hub.is_none() {
                anyhow::bail!("--hub is required in node mode");
            }
        } else if self.node_id.is_some() || self.hub.is_some() {
            anyhow::bail!("--node-id and --hub are only valid in node mode");
        }

        if self.in_process && self.mode != ExecutionMode::Run {
            anyhow::bail!("--in-process is only valid in run mode");
        }

        Ok(())
    }
}
