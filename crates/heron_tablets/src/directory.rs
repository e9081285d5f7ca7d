//! Node directory: the balancer's view of which nodes/shards exist and
//! which are being drained.
//!
//! Membership itself is owned by the external node registry; this is a
//! thin projection keyed by opaque IDs, plus the decommission flag that
//! drives drain-priority balancing.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use heron_common::types::{NodeId, ShardId};
use heron_common::{HeronResult, TabletError};

use crate::model::ReplicaLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Normal,
    /// Flagged for decommission: a drain target for the balancer, never
    /// a destination.
    Draining,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Normal => write!(f, "normal"),
            NodeState::Draining => write!(f, "draining"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node: NodeId,
    pub shard_count: u32,
    pub state: NodeState,
}

/// Thread-safe directory of known nodes. `BTreeMap` keeps iteration
/// order deterministic (lowest node id first), which the balancer's
/// tie-breaking depends on.
pub struct NodeDirectory {
    nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_node(&self, node: NodeId, shard_count: u32) {
        self.nodes.write().insert(
            node,
            NodeInfo {
                node,
                shard_count,
                state: NodeState::Normal,
            },
        );
    }

    pub fn remove_node(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.read().contains_key(&node)
    }

    pub fn get(&self, node: NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(&node).cloned()
    }

    pub fn set_state(&self, node: NodeId, state: NodeState) -> HeronResult<()> {
        let mut nodes = self.nodes.write();
        let info = nodes
            .get_mut(&node)
            .ok_or(TabletError::NodeNotFound(node))?;
        info.state = state;
        Ok(())
    }

    pub fn is_draining(&self, node: NodeId) -> bool {
        self.nodes
            .read()
            .get(&node)
            .map(|n| n.state == NodeState::Draining)
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }

    /// Every shard of every known node, in (node, shard) order.
    pub fn all_shards(&self) -> Vec<ReplicaLocation> {
        self.nodes
            .read()
            .values()
            .flat_map(|n| {
                (0..n.shard_count).map(|s| ReplicaLocation {
                    node: n.node,
                    shard: ShardId(s),
                })
            })
            .collect()
    }
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shards_enumerated_in_order() {
        let dir = NodeDirectory::new();
        dir.add_node(NodeId(2), 2);
        dir.add_node(NodeId(1), 1);
        let shards = dir.all_shards();
        assert_eq!(
            shards,
            vec![
                ReplicaLocation::new(1, 0),
                ReplicaLocation::new(2, 0),
                ReplicaLocation::new(2, 1),
            ]
        );
    }

    #[test]
    fn test_draining_flag() {
        let dir = NodeDirectory::new();
        dir.add_node(NodeId(1), 1);
        assert!(!dir.is_draining(NodeId(1)));
        dir.set_state(NodeId(1), NodeState::Draining).unwrap();
        assert!(dir.is_draining(NodeId(1)));
        dir.set_state(NodeId(1), NodeState::Normal).unwrap();
        assert!(!dir.is_draining(NodeId(1)));
    }

    #[test]
    fn test_set_state_unknown_node_fails() {
        let dir = NodeDirectory::new();
        assert!(dir.set_state(NodeId(7), NodeState::Draining).is_err());
    }
}
