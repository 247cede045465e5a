//! In-process channel mesh
//!
//! Connects N nodes running as tasks in one process. The leader holds one
//! sender per follower for broadcasts and a single receiver for teardown
//! signals; each follower holds the matching ends.

use super::channel::{BroadcastSignal, ChannelError, InterNodeChannel};
use crate::node::{NodeId, Role};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Builder for a fully-connected in-process mesh
pub struct MemoryMesh;

impl MemoryMesh {
    /// One channel per node, ordered by node id (index 0 is the leader)
    pub fn new(node_count: u32) -> Vec<MemoryChannel> {
        let node_count = node_count.max(1);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let mut followers = Vec::new();
        let mut follower_channels = Vec::new();
        for node in NodeId::followers(node_count) {
            let (tx, rx) = mpsc::unbounded_channel();
            followers.push((node, tx));
            follower_channels.push(MemoryChannel {
                node,
                node_count,
                end: End::Follower {
                    broadcasts: rx,
                    done: done_tx.clone(),
                },
            });
        }

        let leader = MemoryChannel {
            node: NodeId::LEADER,
            node_count,
            end: End::Leader {
                followers,
                done: done_rx,
            },
        };

        let mut channels = vec![leader];
        channels.extend(follower_channels);
        channels
    }
}

enum End {
    Leader {
        followers: Vec<(NodeId, mpsc::UnboundedSender<BroadcastSignal>)>,
        done: mpsc::UnboundedReceiver<NodeId>,
    },
    Follower {
        broadcasts: mpsc::UnboundedReceiver<BroadcastSignal>,
        done: mpsc::UnboundedSender<NodeId>,
    },
}

/// One node's end of a [`MemoryMesh`]
pub struct MemoryChannel {
    node: NodeId,
    node_count: u32,
    end: End,
}

impl InterNodeChannel for MemoryChannel {
    fn node(&self) -> NodeId {
        self.node
    }

    fn node_count(&self) -> u32 {
        self.node_count
    }

    async fn broadcast(&mut self, signal: BroadcastSignal) -> Result<(), ChannelError> {
        let End::Leader { followers, .. } = &self.end else {
            return Err(ChannelError::WrongRole {
                operation: "broadcast",
                expected: Role::Leader,
            });
        };

        let mut failed = Vec::new();
        for (node, tx) in followers.iter() {
            if tx.send(signal.clone()).is_err() {
                failed.push(*node);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::Delivery {
                nodes: failed,
                reason: "follower channel closed".to_string(),
            })
        }
    }

    async fn receive_broadcast(&mut self, timeout: Duration) -> Result<BroadcastSignal, ChannelError> {
        let node = self.node;
        let End::Follower { broadcasts, .. } = &mut self.end else {
            return Err(ChannelError::WrongRole {
                operation: "receive_broadcast",
                expected: Role::Follower,
            });
        };

        match tokio::time::timeout(timeout, broadcasts.recv()).await {
            Ok(Some(signal)) => Ok(signal),
            Ok(None) => Err(ChannelError::Closed(format!("leader disconnected before broadcasting to node {}", node))),
            Err(_) => Err(ChannelError::Timeout {
                waited: timeout,
                what: "setup broadcast",
            }),
        }
    }

    async fn signal_teardown_done(&mut self, node: NodeId) -> Result<(), ChannelError> {
        match &self.end {
            // The leader is its own barrier; nothing to send.
            End::Leader { .. } => Ok(()),
            End::Follower { done, .. } => done
                .send(node)
                .map_err(|_| ChannelError::Closed("leader is no longer waiting for teardown signals".to_string())),
        }
    }

    async fn await_all_teardown_done(&mut self, timeout: Duration) -> Result<Vec<NodeId>, ChannelError> {
        let node_count = self.node_count;
        let End::Leader { done, .. } = &mut self.end else {
            return Err(ChannelError::WrongRole {
                operation: "await_all_teardown_done",
                expected: Role::Leader,
            });
        };

        let mut pending: BTreeSet<NodeId> = NodeId::followers(node_count).collect();
        let deadline = Instant::now() + timeout;
        while !pending.is_empty() {
            match timeout_at(deadline, done.recv()).await {
                Ok(Some(node)) => {
                    pending.remove(&node);
                }
                // Every follower end is gone; nobody else can signal.
                Ok(None) => break,
                Err(_) => break,
            }
        }

        Ok(pending.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::Payload;

    fn node(id: u32) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_mesh_layout() {
        let mesh = MemoryMesh::new(3);
        let ids: Vec<u32> = mesh.iter().map(|c| c.node().get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(mesh.iter().all(|c| c.node_count() == 3));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_follower() {
        let mut mesh = MemoryMesh::new(3);
        let mut f3 = mesh.pop().unwrap();
        let mut f2 = mesh.pop().unwrap();
        let mut leader = mesh.pop().unwrap();

        leader
            .broadcast(BroadcastSignal::Payload(Payload::from("DATA")))
            .await
            .unwrap();

        let timeout = Duration::from_secs(1);
        let expected = BroadcastSignal::Payload(Payload::from("DATA"));
        assert_eq!(f2.receive_broadcast(timeout).await.unwrap(), expected);
        assert_eq!(f3.receive_broadcast(timeout).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_broadcast_survives_dead_follower() {
        let mut mesh = MemoryMesh::new(3);
        let f3 = mesh.pop().unwrap();
        let mut f2 = mesh.pop().unwrap();
        let mut leader = mesh.pop().unwrap();
        drop(f3);

        let err = leader.broadcast(BroadcastSignal::NoPayload).await.unwrap_err();
        assert_eq!(
            err,
            ChannelError::Delivery {
                nodes: vec![node(3)],
                reason: "follower channel closed".to_string(),
            }
        );
        assert_eq!(
            f2.receive_broadcast(Duration::from_secs(1)).await.unwrap(),
            BroadcastSignal::NoPayload
        );
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let mut mesh = MemoryMesh::new(2);
        let mut follower = mesh.pop().unwrap();
        let _leader = mesh.pop().unwrap();

        let err = follower
            .receive_broadcast(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_receive_fails_when_leader_gone() {
        let mut mesh = MemoryMesh::new(2);
        let mut follower = mesh.pop().unwrap();
        drop(mesh);

        let err = follower
            .receive_broadcast(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed(_)));
    }

    #[tokio::test]
    async fn test_role_checks() {
        let mut mesh = MemoryMesh::new(2);
        let mut follower = mesh.pop().unwrap();
        let mut leader = mesh.pop().unwrap();

        assert!(matches!(
            follower.broadcast(BroadcastSignal::NoPayload).await,
            Err(ChannelError::WrongRole { expected: Role::Leader, .. })
        ));
        assert!(matches!(
            leader.receive_broadcast(Duration::from_millis(1)).await,
            Err(ChannelError::WrongRole { expected: Role::Follower, .. })
        ));
        assert!(matches!(
            follower.await_all_teardown_done(Duration::from_millis(1)).await,
            Err(ChannelError::WrongRole { .. })
        ));
    }

    #[tokio::test]
    async fn test_barrier_collects_all_signals() {
        let mut mesh = MemoryMesh::new(3);
        let mut f3 = mesh.pop().unwrap();
        let mut f2 = mesh.pop().unwrap();
        let mut leader = mesh.pop().unwrap();

        f3.signal_teardown_done(node(3)).await.unwrap();
        f2.signal_teardown_done(node(2)).await.unwrap();

        let missing = leader
            .await_all_teardown_done(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_barrier_reports_missing_followers() {
        let mut mesh = MemoryMesh::new(3);
        let _f3 = mesh.pop().unwrap();
        let mut f2 = mesh.pop().unwrap();
        let mut leader = mesh.pop().unwrap();

        f2.signal_teardown_done(node(2)).await.unwrap();

        let missing = leader
            .await_all_teardown_done(Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(missing, vec![node(3)]);
    }

    #[tokio::test]
    async fn test_single_node_barrier_is_immediate() {
        let mut mesh = MemoryMesh::new(1);
        let mut leader = mesh.pop().unwrap();
        let missing = leader
            .await_all_teardown_done(Duration::from_secs(60))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
