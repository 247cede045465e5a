//! Node identity and role
//!
//! Nodes are numbered from 1. Node 1 is always the leader; every other node
//! is a follower.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one node in a parallel run (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct NodeId(u32);

impl NodeId {
    /// The leader node
    pub const LEADER: NodeId = NodeId(1);

    /// Create a node id, rejecting 0
    pub const fn new(id: u32) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Raw 1-based id
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_leader(self) -> bool {
        self.0 == 1
    }

    pub const fn role(self) -> Role {
        if self.is_leader() {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    /// All node ids of a run with `count` nodes, in ascending order
    pub fn all(count: u32) -> impl Iterator<Item = NodeId> {
        (1..=count).map(NodeId)
    }

    /// Follower ids (2..=count) of a run with `count` nodes
    pub fn followers(count: u32) -> impl Iterator<Item = NodeId> {
        (2..=count).map(NodeId)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for NodeId {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        NodeId::new(value).ok_or_else(|| "node ids start at 1".to_string())
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Role a node plays in the suite-level protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// Format a list of node ids as "2, 3, 5"
pub fn join_nodes(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_rejected() {
        assert!(NodeId::new(0).is_none());
        assert!(NodeId::try_from(0).is_err());
    }

    #[test]
    fn test_roles() {
        assert_eq!(NodeId::LEADER.role(), Role::Leader);
        assert_eq!(NodeId::new(2).unwrap().role(), Role::Follower);
    }

    #[test]
    fn test_ranges() {
        let all: Vec<u32> = NodeId::all(3).map(NodeId::get).collect();
        assert_eq!(all, vec![1, 2, 3]);

        let followers: Vec<u32> = NodeId::followers(3).map(NodeId::get).collect();
        assert_eq!(followers, vec![2, 3]);

        assert_eq!(NodeId::followers(1).count(), 0);
    }

    #[test]
    fn test_serde_rejects_zero() {
        let bytes = rmp_serde::to_vec(&0u32).unwrap();
        assert!(rmp_serde::from_slice::<NodeId>(&bytes).is_err());

        let bytes = rmp_serde::to_vec(&NodeId::new(4).unwrap()).unwrap();
        assert_eq!(rmp_serde::from_slice::<NodeId>(&bytes).unwrap().get(), 4);
    }

    #[test]
    fn test_join_nodes() {
        let nodes = vec![NodeId::new(2).unwrap(), NodeId::new(3).unwrap()];
        assert_eq!(join_nodes(&nodes), "2, 3");
    }
}
