//! TCP channel for node processes
//!
//! A node process connects to the [`super::hub::Hub`], introduces itself with
//! a HELLO, and from then on every message travels through two tasks: a
//! writer draining an unbounded queue (so hooks can emit output from
//! synchronous code) and a reader dispatching broadcasts and teardown signals
//! to the coordinator.

use super::channel::{require_role, BroadcastSignal, ChannelError, InterNodeChannel};
use super::protocol::*;
use crate::node::{NodeId, Role};
use crate::output::OutputSink;
use crate::report::NodeReport;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// A node's connection to the hub
pub struct TcpChannel {
    node: NodeId,
    node_count: u32,
    outgoing: mpsc::UnboundedSender<Frame>,
    broadcasts: mpsc::UnboundedReceiver<BroadcastSignal>,
    teardown_done: mpsc::UnboundedReceiver<NodeId>,
    writer: JoinHandle<Result<()>>,
    reader: JoinHandle<()>,
}

impl TcpChannel {
    /// Connect to the hub and register as `node`
    pub async fn connect(addr: &str, node: NodeId, node_count: u32, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("Timed out connecting to hub at {}", addr))?
            .with_context(|| format!("Failed to connect to hub at {}", addr))?;
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;

        let (mut read_half, mut write_half) = stream.into_split();

        let hello = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            node_id: node,
            node_count,
            hostname: local_hostname(),
        };
        write_message(&mut write_half, &Message::Hello(hello)).await?;

        match read_message(&mut read_half).await? {
            Some(Message::Welcome(welcome)) => {
                if welcome.protocol_version != PROTOCOL_VERSION {
                    anyhow::bail!(
                        "Protocol version mismatch: hub={}, node={}",
                        welcome.protocol_version,
                        PROTOCOL_VERSION
                    );
                }
                if welcome.node_count != node_count {
                    anyhow::bail!(
                        "Node count mismatch: hub expects {}, node {} was launched with {}",
                        welcome.node_count,
                        node,
                        node_count
                    );
                }
            }
            Some(Message::Error(err)) => anyhow::bail!("Hub rejected node {}: {}", node, err.error),
            Some(other) => anyhow::bail!("Expected WELCOME, got {:?}", other),
            None => anyhow::bail!("Hub closed the connection during registration"),
        }

        tracing::debug!(node = node.get(), addr, "registered with hub");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcasts) = mpsc::unbounded_channel();
        let (done_tx, teardown_done) = mpsc::unbounded_channel();

        let writer = tokio::spawn(writer_loop(write_half, outgoing_rx));
        let reader = tokio::spawn(reader_loop(read_half, node, broadcast_tx, done_tx));

        Ok(Self {
            node,
            node_count,
            outgoing,
            broadcasts,
            teardown_done,
            writer,
            reader,
        })
    }

    /// Sink forwarding this node's output to the hub's aggregator
    pub fn output_sink(&self) -> Arc<dyn OutputSink> {
        Arc::new(RemoteOutput {
            outgoing: self.outgoing.clone(),
        })
    }

    /// Send the node's final report to the hub
    pub fn submit_report(&self, report: NodeReport) -> Result<()> {
        self.send(Message::Report(report))
            .map_err(|e| anyhow::anyhow!("Failed to submit report: {}", e))
    }

    /// Flush every queued message and close the connection
    pub async fn close(self) -> Result<()> {
        let TcpChannel {
            outgoing, writer, reader, ..
        } = self;
        // The writer stops after the report, or once every sender is gone.
        drop(outgoing);
        let result = match tokio::time::timeout(Duration::from_secs(10), writer).await {
            Ok(joined) => joined.context("Writer task panicked")?,
            Err(_) => Err(anyhow::anyhow!("Timed out flushing messages to hub")),
        };
        reader.abort();
        result
    }

    /// Encode and queue a message; oversized messages fail here, not at the hub
    fn send(&self, msg: Message) -> Result<(), ChannelError> {
        let frame = Frame::encode(&msg).map_err(|e| ChannelError::Transport(format!("{:#}", e)))?;
        self.outgoing
            .send(frame)
            .map_err(|_| ChannelError::Closed("connection to hub is gone".to_string()))
    }
}

/// A framed message waiting for the writer task
struct Frame {
    bytes: Vec<u8>,
    /// Nothing is sent after the report
    last: bool,
}

impl Frame {
    fn encode(msg: &Message) -> Result<Self> {
        Ok(Self {
            bytes: serialize_message(msg)?,
            last: matches!(msg, Message::Report(_)),
        })
    }
}

impl InterNodeChannel for TcpChannel {
    fn node(&self) -> NodeId {
        self.node
    }

    fn node_count(&self) -> u32 {
        self.node_count
    }

    async fn broadcast(&mut self, signal: BroadcastSignal) -> Result<(), ChannelError> {
        require_role(self.node, Role::Leader, "broadcast")?;
        // The hub fans out and reports per-follower delivery failures itself.
        self.send(Message::Broadcast(signal))
    }

    async fn receive_broadcast(&mut self, timeout: Duration) -> Result<BroadcastSignal, ChannelError> {
        require_role(self.node, Role::Follower, "receive_broadcast")?;
        match tokio::time::timeout(timeout, self.broadcasts.recv()).await {
            Ok(Some(signal)) => Ok(signal),
            Ok(None) => Err(ChannelError::Closed("hub connection closed before the setup broadcast".to_string())),
            Err(_) => Err(ChannelError::Timeout {
                waited: timeout,
                what: "setup broadcast",
            }),
        }
    }

    async fn signal_teardown_done(&mut self, node: NodeId) -> Result<(), ChannelError> {
        if self.node.is_leader() {
            return Ok(());
        }
        self.send(Message::TeardownDone { node_id: node })
    }

    async fn await_all_teardown_done(&mut self, timeout: Duration) -> Result<Vec<NodeId>, ChannelError> {
        require_role(self.node, Role::Leader, "await_all_teardown_done")?;

        let mut pending: BTreeSet<NodeId> = NodeId::followers(self.node_count).collect();
        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            match timeout_at(deadline, self.teardown_done.recv()).await {
                Ok(Some(node)) => {
                    pending.remove(&node);
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(pending.into_iter().collect())
    }
}

/// Output sink that ships text to the hub
struct RemoteOutput {
    outgoing: mpsc::UnboundedSender<Frame>,
}

impl OutputSink for RemoteOutput {
    fn emit(&self, node: NodeId, text: &str) {
        let msg = Message::Output(OutputMessage {
            node_id: node,
            text: text.to_string(),
        });
        let frame = match Frame::encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(node = node.get(), error = %format!("{:#}", e), "dropping output");
                return;
            }
        };
        if self.outgoing.send(frame).is_err() {
            tracing::warn!(node = node.get(), "hub connection closed, dropping output");
        }
    }
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<Frame>) -> Result<()> {
    while let Some(frame) = outgoing.recv().await {
        write_frame(&mut write_half, &frame.bytes).await?;
        if frame.last {
            break;
        }
    }
    use tokio::io::AsyncWriteExt;
    write_half.shutdown().await.context("Failed to shut down hub connection")?;
    Ok(())
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    node: NodeId,
    broadcasts: mpsc::UnboundedSender<BroadcastSignal>,
    teardown_done: mpsc::UnboundedSender<NodeId>,
) {
    loop {
        match read_message(&mut read_half).await {
            Ok(Some(Message::Broadcast(signal))) => {
                let _ = broadcasts.send(signal);
            }
            Ok(Some(Message::TeardownDone { node_id })) => {
                let _ = teardown_done.send(node_id);
            }
            Ok(Some(Message::Error(err))) => {
                tracing::error!(node = node.get(), error = %err.error, "hub reported an error");
            }
            Ok(Some(other)) => {
                tracing::warn!(node = node.get(), "unexpected message from hub: {:?}", other);
            }
            Ok(None) => {
                tracing::debug!(node = node.get(), "hub closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(node = node.get(), error = %e, "error reading from hub");
                break;
            }
        }
    }
}

pub(crate) fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
