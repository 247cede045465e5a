//! Relay hub for multi-process runs
//!
//! The hub runs inside the launcher process. It accepts one connection per
//! node and:
//!
//! - forwards leader broadcasts to every follower (and replays them to
//!   followers that connect late)
//! - forwards follower teardown-done signals to the leader
//! - feeds node output into the [`OutputAggregator`]
//! - collects each node's final [`NodeReport`] into a [`RunSummary`]
//!
//! Messages from one connection are handled strictly in order.

use super::channel::BroadcastSignal;
use super::protocol::*;
use crate::node::NodeId;
use crate::output::{OutputAggregator, OutputSink};
use crate::report::{FailureKind, FailureRecord, NodeReport, RunSummary};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Relay server connecting node processes
pub struct Hub {
    listener: TcpListener,
    node_count: u32,
    aggregator: Arc<OutputAggregator>,
}

#[derive(Default)]
struct HubState {
    connected: BTreeSet<NodeId>,
    leader: Option<mpsc::UnboundedSender<Message>>,
    followers: BTreeMap<NodeId, mpsc::UnboundedSender<Message>>,
    broadcast_log: Vec<BroadcastSignal>,
    teardown_done: BTreeSet<NodeId>,
    reported: BTreeSet<NodeId>,
    relay_failures: Vec<FailureRecord>,
}

impl HubState {
    /// Validate a HELLO and register the node in one step
    ///
    /// On success WELCOME is queued first, followed by anything the node
    /// missed.
    fn admit(&mut self, hello: &HelloMessage, node_count: u32, tx: mpsc::UnboundedSender<Message>) -> Result<(), String> {
        validate_hello(hello, node_count, &self.connected)?;

        let node = hello.node_id;
        let _ = tx.send(Message::Welcome(WelcomeMessage {
            protocol_version: PROTOCOL_VERSION,
            node_count,
        }));
        self.connected.insert(node);
        if node.is_leader() {
            for done in &self.teardown_done {
                let _ = tx.send(Message::TeardownDone { node_id: *done });
            }
            self.leader = Some(tx);
        } else {
            for signal in &self.broadcast_log {
                let _ = tx.send(Message::Broadcast(signal.clone()));
            }
            self.followers.insert(node, tx);
        }
        Ok(())
    }

    fn unregister(&mut self, node: NodeId) {
        if node.is_leader() {
            self.leader = None;
        } else {
            self.followers.remove(&node);
        }
    }

    /// Fan a leader broadcast out to every connected follower
    ///
    /// A follower that already finished its teardown or reported no longer
    /// reads broadcasts, so failing to reach it is not a failure.
    fn relay_broadcast(&mut self, signal: BroadcastSignal) {
        let mut failed = Vec::new();
        for (follower, tx) in &self.followers {
            if tx.send(Message::Broadcast(signal.clone())).is_err()
                && !self.teardown_done.contains(follower)
                && !self.reported.contains(follower)
            {
                failed.push(*follower);
            }
        }
        for follower in failed {
            self.relay_failures.push(FailureRecord {
                node: follower,
                kind: FailureKind::TransportError,
                step: None,
                cause: "setup broadcast could not be delivered".to_string(),
                is_panic: false,
            });
        }
        self.broadcast_log.push(signal);
    }
}

enum HubEvent {
    Report(NodeReport),
    Disconnected(NodeId),
}

type SharedState = Arc<Mutex<HubState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, HubState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

impl Hub {
    /// Bind the hub's listener
    pub async fn bind(addr: &str, node_count: u32, aggregator: Arc<OutputAggregator>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind hub on {}", addr))?;
        Ok(Self {
            listener,
            node_count,
            aggregator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read hub address")
    }

    /// Relay messages until every node reported, every node disconnected,
    /// or `run_timeout` elapsed
    pub async fn serve(self, run_timeout: Duration) -> Result<RunSummary> {
        let mut summary = RunSummary::new(self.node_count);
        let state: SharedState = Arc::new(Mutex::new(HubState::default()));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let deadline = Instant::now() + run_timeout;
        let mut disconnected = BTreeSet::new();

        tracing::info!(nodes = self.node_count, addr = ?self.listener.local_addr().ok(), "hub serving");

        loop {
            if summary.nodes.len() as u32 == self.node_count {
                break;
            }
            if disconnected.len() as u32 == self.node_count {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "node connected");
                            let state = state.clone();
                            let events = events_tx.clone();
                            let aggregator = self.aggregator.clone();
                            let node_count = self.node_count;
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, node_count, state, aggregator, events).await {
                                    tracing::warn!(%peer, error = %format!("{:#}", e), "node connection failed");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to accept node connection"),
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(HubEvent::Report(report)) => {
                            tracing::debug!(node = report.node.get(), "report received");
                            summary.insert(report);
                        }
                        Some(HubEvent::Disconnected(node)) => {
                            disconnected.insert(node);
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("hub run timeout elapsed");
                    break;
                }
            }
        }

        let relay_failures = std::mem::take(&mut lock(&state).relay_failures);
        for failure in relay_failures {
            summary.record_run_failure(failure);
        }
        summary.finish();
        Ok(summary)
    }
}

async fn handle_connection(
    stream: TcpStream,
    node_count: u32,
    state: SharedState,
    aggregator: Arc<OutputAggregator>,
    events: mpsc::UnboundedSender<HubEvent>,
) -> Result<()> {
    stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
    let (mut read_half, mut write_half) = stream.into_split();

    let hello = match read_message(&mut read_half).await? {
        Some(Message::Hello(hello)) => hello,
        Some(other) => anyhow::bail!("Expected HELLO, got {:?}", other),
        None => anyhow::bail!("Connection closed before HELLO"),
    };
    let node = hello.node_id;

    let (tx, rx) = mpsc::unbounded_channel();
    let admitted = lock(&state).admit(&hello, node_count, tx);
    if let Err(reason) = admitted {
        let error = ErrorMessage {
            node_id: Some(node),
            error: reason.clone(),
        };
        write_message(&mut write_half, &Message::Error(error)).await?;
        anyhow::bail!(reason);
    }
    tokio::spawn(forward_loop(write_half, rx, node));
    tracing::info!(node = node.get(), host = %hello.hostname, "node registered");

    let result = relay_loop(&mut read_half, node, &state, &aggregator, &events).await;

    lock(&state).unregister(node);
    let _ = events.send(HubEvent::Disconnected(node));
    result
}

fn validate_hello(hello: &HelloMessage, node_count: u32, connected: &BTreeSet<NodeId>) -> Result<(), String> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "Protocol version mismatch: hub={}, node={}",
            PROTOCOL_VERSION, hello.protocol_version
        ));
    }
    if hello.node_count != node_count {
        return Err(format!(
            "Node count mismatch: hub expects {}, node was launched with {}",
            node_count, hello.node_count
        ));
    }
    if hello.node_id.get() > node_count {
        return Err(format!("Node id {} is out of range 1..={}", hello.node_id, node_count));
    }
    if connected.contains(&hello.node_id) {
        return Err(format!("Node {} is already connected", hello.node_id));
    }
    Ok(())
}

async fn relay_loop(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
    node: NodeId,
    state: &SharedState,
    aggregator: &OutputAggregator,
    events: &mpsc::UnboundedSender<HubEvent>,
) -> Result<()> {
    while let Some(msg) = read_message(read_half).await? {
        match msg {
            Message::Broadcast(signal) if node.is_leader() => {
                lock(state).relay_broadcast(signal);
            }
            Message::TeardownDone { node_id } => {
                let mut state = lock(state);
                state.teardown_done.insert(node_id);
                if let Some(leader) = &state.leader {
                    if leader.send(Message::TeardownDone { node_id }).is_err() {
                        tracing::warn!(node = node_id.get(), "leader gone before teardown signal");
                    }
                }
            }
            Message::Output(output) => {
                aggregator.emit(output.node_id, &output.text);
            }
            Message::Report(report) => {
                lock(state).reported.insert(report.node);
                let _ = events.send(HubEvent::Report(report));
            }
            Message::Error(err) => {
                tracing::error!(node = node.get(), error = %err.error, "node reported an error");
            }
            other => {
                tracing::warn!(node = node.get(), "unexpected message: {:?}", other);
            }
        }
    }
    Ok(())
}

async fn forward_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>, node: NodeId) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut write_half, &msg).await {
            tracing::warn!(node = node.get(), error = %format!("{:#}", e), "failed to forward message");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ChannelError, InterNodeChannel, TcpChannel};
    use crate::output::{OutputMode, SharedBuffer};
    use crate::suite::Payload;

    fn node(id: u32) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_relay_between_leader_and_follower() {
        let buffer = SharedBuffer::new();
        let aggregator = Arc::new(OutputAggregator::new(OutputMode::Streamed, Box::new(buffer.clone())));
        let hub = Hub::bind("127.0.0.1:0", 2, aggregator).await.unwrap();
        let addr = hub.local_addr().unwrap().to_string();
        let serve = tokio::spawn(hub.serve(Duration::from_secs(10)));

        let timeout = Duration::from_secs(5);
        let mut leader = TcpChannel::connect(&addr, node(1), 2, timeout).await.unwrap();
        leader
            .broadcast(BroadcastSignal::Payload(Payload::from("DATA")))
            .await
            .unwrap();

        // Connects after the broadcast; the hub replays it.
        let mut follower = TcpChannel::connect(&addr, node(2), 2, timeout).await.unwrap();
        let signal = follower.receive_broadcast(timeout).await.unwrap();
        assert_eq!(signal, BroadcastSignal::Payload(Payload::from("DATA")));

        follower.output_sink().emit(node(2), "AFTER_A_2");
        follower.signal_teardown_done(node(2)).await.unwrap();
        let missing = leader.await_all_teardown_done(timeout).await.unwrap();
        assert!(missing.is_empty());
        assert!(buffer.contents().contains("[2] AFTER_A_2"));

        for channel in [leader, follower] {
            let report = NodeReport {
                node: channel.node(),
                setup: Default::default(),
                specs: Vec::new(),
                teardown: Default::default(),
                failures: Vec::new(),
                missing_followers: Vec::new(),
            };
            channel.submit_report(report).unwrap();
            channel.close().await.unwrap();
        }

        let summary = serve.await.unwrap().unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_out_of_range_nodes() {
        let aggregator = Arc::new(OutputAggregator::new(OutputMode::Batched, Box::new(SharedBuffer::new())));
        let hub = Hub::bind("127.0.0.1:0", 2, aggregator).await.unwrap();
        let addr = hub.local_addr().unwrap().to_string();
        let serve = tokio::spawn(hub.serve(Duration::from_millis(500)));

        let timeout = Duration::from_secs(5);
        let _leader = TcpChannel::connect(&addr, node(1), 2, timeout).await.unwrap();
        let duplicate = TcpChannel::connect(&addr, node(1), 2, timeout).await;
        assert!(duplicate.is_err());

        let out_of_range = TcpChannel::connect(&addr, node(3), 2, timeout).await;
        assert!(out_of_range.is_err());

        let wrong_count = TcpChannel::connect(&addr, node(2), 5, timeout).await;
        assert!(wrong_count.is_err());

        let summary = serve.await.unwrap().unwrap();
        assert!(!summary.succeeded());
        assert_eq!(summary.missing_nodes().len(), 2);
    }

    fn hello(id: u32, node_count: u32) -> HelloMessage {
        HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            node_id: node(id),
            node_count,
            hostname: "localhost".to_string(),
        }
    }

    #[test]
    fn test_admit_rejects_second_hello_for_same_node() {
        let mut state = HubState::default();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        state.admit(&hello(2, 3), 3, first_tx).unwrap();
        let err = state.admit(&hello(2, 3), 3, second_tx).unwrap_err();
        assert!(err.contains("already connected"));

        assert!(matches!(first_rx.try_recv(), Ok(Message::Welcome(_))));
        assert!(second_rx.try_recv().is_err());

        // The registered sender is still the first connection's
        state.relay_broadcast(BroadcastSignal::NoPayload);
        assert_eq!(first_rx.try_recv().unwrap(), Message::Broadcast(BroadcastSignal::NoPayload));
    }

    #[test]
    fn test_admit_replays_broadcasts_after_welcome() {
        let mut state = HubState::default();
        state.relay_broadcast(BroadcastSignal::Payload(Payload::from("DATA")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.admit(&hello(3, 3), 3, tx).unwrap();

        assert!(matches!(rx.try_recv(), Ok(Message::Welcome(_))));
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Broadcast(BroadcastSignal::Payload(Payload::from("DATA")))
        );
    }

    #[test]
    fn test_finished_follower_is_not_a_relay_failure() {
        let mut state = HubState::default();
        for id in [2, 3, 4] {
            let (tx, rx) = mpsc::unbounded_channel();
            state.admit(&hello(id, 4), 4, tx).unwrap();
            drop(rx);
        }
        state.teardown_done.insert(node(2));
        state.reported.insert(node(3));

        state.relay_broadcast(BroadcastSignal::NoPayload);

        let failed: Vec<NodeId> = state.relay_failures.iter().map(|f| f.node).collect();
        assert_eq!(failed, vec![node(4)]);
        assert_eq!(state.broadcast_log.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_broadcast_fails_on_the_leader() {
        let aggregator = Arc::new(OutputAggregator::new(OutputMode::Batched, Box::new(SharedBuffer::new())));
        let hub = Hub::bind("127.0.0.1:0", 2, aggregator).await.unwrap();
        let addr = hub.local_addr().unwrap().to_string();
        let _serve = tokio::spawn(hub.serve(Duration::from_secs(10)));

        let timeout = Duration::from_secs(5);
        let mut leader = TcpChannel::connect(&addr, node(1), 2, timeout).await.unwrap();
        let mut follower = TcpChannel::connect(&addr, node(2), 2, timeout).await.unwrap();

        let huge = Payload::from_bytes(vec![0u8; MAX_MESSAGE_LEN + 1]);
        let err = leader.broadcast(BroadcastSignal::Payload(huge)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)), "{:?}", err);

        // The connection survives; the next signal still gets through
        leader.broadcast(BroadcastSignal::NoPayload).await.unwrap();
        assert_eq!(follower.receive_broadcast(timeout).await.unwrap(), BroadcastSignal::NoPayload);
    }
}
