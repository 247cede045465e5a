//! suitesync - parallel suite coordinator
//!
//! Runs one test suite across N nodes, with suite-level setup and teardown
//! hooks that follow a strict cross-node protocol.
//!
//! # Architecture
//!
//! - **Suite chains**: setup steps run on the leader only or on every node;
//!   teardown ends with an optional leader step that runs after every node
//!   finished its own teardown
//! - **Coordinator**: a per-node state machine driving those chains over an
//!   inter-node channel
//! - **Transport**: in-process channels or a TCP hub for one process per node
//! - **Output**: per-node text merged in batched or streamed mode
//! - **Reporting**: typed failures with markers in the merged output

pub mod config;
pub mod coordinator;
pub mod distributed;
pub mod fixtures;
pub mod launch;
pub mod node;
pub mod output;
pub mod report;
pub mod runner;
pub mod suite;

// Re-export commonly used types
pub use config::RunConfig;
pub use coordinator::{CoordinatorSettings, SuiteCoordinator, TeardownPolicy};
pub use node::NodeId;
pub use output::{OutputAggregator, OutputMode};
pub use report::{FailureKind, RunSummary};
pub use runner::{NodeRunner, RoundRobin, Spec, SpecSource};
pub use suite::{Payload, SetupChain, Suite, TeardownChain};

/// Result type used throughout suitesync
pub type Result<T> = anyhow::Result<T>;
