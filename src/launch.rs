//! Run launchers
//!
//! [`run_in_process`] runs every node as a tokio task connected through a
//! [`MemoryMesh`]. [`run_tcp_node`] is the body of one node process in a
//! multi-process run; the launcher side of that setup is
//! [`crate::distributed::Hub`].

use crate::config::RunConfig;
use crate::distributed::{InterNodeChannel, MemoryMesh, TcpChannel};
use crate::node::NodeId;
use crate::output::{NodeOutput, OutputAggregator};
use crate::report::{NodeReport, RunSummary};
use crate::runner::{NodeRunner, SpecSource};
use crate::suite::Suite;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// How long a node process keeps trying to reach the hub
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run all nodes of `config` inside the current process
///
/// Batched output is flushed to the aggregator's writer before returning.
pub async fn run_in_process(
    config: &RunConfig,
    suite: Arc<Suite>,
    source: &dyn SpecSource,
    aggregator: Arc<OutputAggregator>,
) -> Result<RunSummary> {
    let settings = config.coordinator_settings();
    let mut summary = RunSummary::new(config.nodes);

    tracing::info!(nodes = config.nodes, output = %aggregator.mode(), "starting in-process run");

    let mut handles = Vec::with_capacity(config.nodes as usize);
    for channel in MemoryMesh::new(config.nodes) {
        let node = channel.node();
        let specs = source.specs_for(node, config.nodes);
        let runner = NodeRunner::new(channel, suite.clone(), aggregator.node_output(node), settings);
        let handle = tokio::spawn(runner.run(specs));
        handles.push((node, handle));
    }

    // A node that finishes early keeps its channel open until every node is
    // done, so later broadcasts to it still succeed.
    let mut finished = Vec::with_capacity(handles.len());
    for (node, handle) in handles {
        match handle.await {
            Ok((report, channel)) => {
                summary.insert(report);
                finished.push(channel);
            }
            // Recorded as a missing report by `finish`.
            Err(e) => tracing::error!(node = node.get(), error = %e, "node task died"),
        }
    }
    drop(finished);

    aggregator.flush().context("Failed to flush node output")?;
    summary.finish();
    Ok(summary)
}

/// Run one node of a multi-process run against the hub at `hub`
pub async fn run_tcp_node(
    hub: &str,
    node: NodeId,
    config: &RunConfig,
    suite: Arc<Suite>,
    source: &dyn SpecSource,
) -> Result<NodeReport> {
    let channel = TcpChannel::connect(hub, node, config.nodes, CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("Node {} failed to join the run", node))?;
    let output = NodeOutput::new(node, channel.output_sink());

    let runner = NodeRunner::new(channel, suite, output, config.coordinator_settings());
    let (report, channel) = runner.run(source.specs_for(node, config.nodes)).await;

    channel.submit_report(report.clone())?;
    channel.close().await?;
    Ok(report)
}
