//! Configuration validation

use super::RunConfig;
use crate::node::NodeId;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &RunConfig) -> Result<()> {
    if config.nodes == 0 {
        anyhow::bail!("nodes must be at least 1");
    }

    if config.broadcast_timeout_ms == 0 {
        anyhow::bail!("broadcast_timeout must be greater than zero");
    }
    if config.barrier_timeout_ms == 0 {
        anyhow::bail!("barrier_timeout must be greater than zero");
    }
    if config.run_timeout_ms == 0 {
        anyhow::bail!("run_timeout must be greater than zero");
    }

    Ok(())
}

/// Validate a node id against the configured node count
pub fn validate_node_id(node_id: u32, config: &RunConfig) -> Result<NodeId> {
    let node = match NodeId::new(node_id) {
        Some(node) => node,
        None => anyhow::bail!("node ids start at 1, got 0"),
    };
    if node_id > config.nodes {
        anyhow::bail!("node id {} is out of range for a {}-node run", node_id, config.nodes);
    }
    Ok(node)
}
