/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Derivation of a stream's local, quorum, and sync nodes.
//!
//! A stream is placed on an ordered list of nodes with a replication factor `K`. The first `K` nodes
//! are quorum nodes: a write is durable once a majority of them acknowledged it. The remaining nodes are
//! sync nodes that receive writes on a best-effort basis. The local node appears at most once in the
//! list; if it does not appear at all, it only forwards requests.

use rand::Rng;

use crate::error::ReplicationError;
use crate::types::basic::NodeAddress;

use super::pool::majority;

/// Number of acknowledgements, counting the local node, needed for a write to a stream with
/// `quorum_nodes` quorum nodes.
pub fn total_quorum_num(quorum_nodes: usize) -> usize {
    majority(quorum_nodes)
}

/// Number of remote acknowledgements needed, given whether the local node is one of the quorum nodes.
pub fn remote_quorum_num(quorum_nodes: usize, local_in_quorum: bool) -> usize {
    let total = total_quorum_num(quorum_nodes);
    if local_in_quorum {
        total - 1
    } else {
        total
    }
}

#[derive(Clone, Debug)]
pub struct StreamNodeSet {
    nodes: Vec<NodeAddress>,
    replication_factor: usize,
    local: NodeAddress,
    local_index: Option<usize>,
    sticky_peer: usize,
}

impl StreamNodeSet {
    /// Build the node set of a stream as seen from `local`.
    ///
    /// A replication factor larger than the node list is clamped to its length. An empty list, a zero
    /// replication factor, or a list that names a node twice are rejected.
    pub fn new(
        nodes: Vec<NodeAddress>,
        replication_factor: usize,
        local: NodeAddress,
    ) -> Result<StreamNodeSet, ReplicationError> {
        if nodes.is_empty() {
            return Err(ReplicationError::invalid_argument("stream has no nodes"));
        }
        if replication_factor == 0 {
            return Err(ReplicationError::invalid_argument("replication factor must be at least one"));
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].contains(node) {
                return Err(ReplicationError::invalid_argument("stream node listed twice").tag("node", node));
            }
        }

        let replication_factor = replication_factor.min(nodes.len());
        let local_index = nodes.iter().position(|node| *node == local);

        let mut set = StreamNodeSet {
            nodes,
            replication_factor,
            local,
            local_index,
            sticky_peer: 0,
        };
        let remote_quorum = set.remote_quorum_nodes().len();
        if remote_quorum > 1 {
            set.sticky_peer = rand::thread_rng().gen_range(0, remote_quorum);
        }
        Ok(set)
    }

    pub fn nodes(&self) -> &[NodeAddress] {
        &self.nodes
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn local(&self) -> NodeAddress {
        self.local
    }

    /// Whether the local node stores the stream at all.
    pub fn local_is_replica(&self) -> bool {
        self.local_index.is_some()
    }

    pub fn local_in_quorum(&self) -> bool {
        matches!(self.local_index, Some(index) if index < self.replication_factor)
    }

    /// Whether the local node is one of the sync nodes.
    pub fn local_in_sync(&self) -> bool {
        matches!(self.local_index, Some(index) if index >= self.replication_factor)
    }

    pub fn quorum_nodes(&self) -> &[NodeAddress] {
        &self.nodes[..self.replication_factor]
    }

    pub fn remote_quorum_nodes(&self) -> Vec<NodeAddress> {
        self.quorum_nodes()
            .iter()
            .filter(|node| **node != self.local)
            .copied()
            .collect()
    }

    /// Remote sync nodes.
    pub fn sync_nodes(&self) -> Vec<NodeAddress> {
        self.nodes[self.replication_factor..]
            .iter()
            .filter(|node| **node != self.local)
            .copied()
            .collect()
    }

    pub fn remote_nodes(&self) -> Vec<NodeAddress> {
        self.nodes.iter().filter(|node| **node != self.local).copied().collect()
    }

    pub fn total_quorum_num(&self) -> usize {
        total_quorum_num(self.replication_factor)
    }

    pub fn remote_quorum_num(&self) -> usize {
        remote_quorum_num(self.replication_factor, self.local_in_quorum())
    }

    /// The remote quorum node requests are forwarded to. `None` if there is no remote quorum node.
    pub fn sticky_peer(&self) -> Option<NodeAddress> {
        let remote = self.remote_quorum_nodes();
        if remote.is_empty() {
            None
        } else {
            Some(remote[self.sticky_peer % remote.len()])
        }
    }

    /// Move on to the next remote quorum node after the sticky peer failed, and return it.
    pub fn advance_sticky_peer(&mut self) -> Option<NodeAddress> {
        self.sticky_peer = self.sticky_peer.wrapping_add(1);
        self.sticky_peer()
    }
}
