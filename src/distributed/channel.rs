//! Inter-node channel contract
//!
//! The suite protocol needs exactly four transport operations: the leader
//! broadcasts setup signals, followers receive them, followers signal that
//! their teardown finished, and the leader waits for those signals. Every
//! wait is bounded by a timeout so a dead peer cannot hang the run.

use crate::node::{join_nodes, NodeId, Role};
use crate::suite::Payload;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// What the leader tells followers at each leader-only setup step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastSignal {
    /// The step produced a payload
    Payload(Payload),
    /// The step succeeded without a payload
    NoPayload,
    /// Setup failed on the leader; no payload will follow
    SetupFailed { cause: String },
}

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Delivery failed for some followers; the others still received it
    #[error("delivery failed to node(s) {}: {reason}", join_nodes(.nodes))]
    Delivery { nodes: Vec<NodeId>, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { waited: Duration, what: &'static str },

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("{operation} is only valid on the {expected}")]
    WrongRole { operation: &'static str, expected: Role },
}

/// Transport connecting the leader with every follower
///
/// Implementations are owned by exactly one node.
pub trait InterNodeChannel: Send {
    /// The node this channel belongs to
    fn node(&self) -> NodeId;

    /// Total number of nodes in the run
    fn node_count(&self) -> u32;

    /// Leader only: send a signal to every follower
    ///
    /// Returns [`ChannelError::Delivery`] naming the followers that could not
    /// be reached; delivery to the others is unaffected.
    fn broadcast(&mut self, signal: BroadcastSignal) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Follower only: wait for the next signal from the leader
    fn receive_broadcast(&mut self, timeout: Duration) -> impl Future<Output = Result<BroadcastSignal, ChannelError>> + Send;

    /// Tell the leader that `node` finished its teardown steps
    fn signal_teardown_done(&mut self, node: NodeId) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Leader only: wait until every follower signalled or `timeout` elapses
    ///
    /// Returns the followers that did not signal in time, in ascending order.
    fn await_all_teardown_done(&mut self, timeout: Duration) -> impl Future<Output = Result<Vec<NodeId>, ChannelError>> + Send;
}

pub(crate) fn require_role(node: NodeId, expected: Role, operation: &'static str) -> Result<(), ChannelError> {
    if node.role() == expected {
        Ok(())
    } else {
        Err(ChannelError::WrongRole { operation, expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_names_nodes() {
        let err = ChannelError::Delivery {
            nodes: vec![NodeId::new(2).unwrap(), NodeId::new(4).unwrap()],
            reason: "receiver dropped".to_string(),
        };
        assert_eq!(err.to_string(), "delivery failed to node(s) 2, 4: receiver dropped");
    }

    #[test]
    fn test_require_role() {
        assert!(require_role(NodeId::LEADER, Role::Leader, "broadcast").is_ok());
        let err = require_role(NodeId::new(2).unwrap(), Role::Leader, "broadcast").unwrap_err();
        assert_eq!(err.to_string(), "broadcast is only valid on the leader");
    }
}
