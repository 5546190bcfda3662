//! The node store: a bounded table of known peers ranked by reach.
//!
//! Peers are inserted with reach 0 the first time they are seen and earn
//! reach by answering searches (see the router's attribution pass). The
//! store answers "who should be asked next about this target" with the
//! peers whose `distance/reach` ratio is lowest. It is a pure ranking;
//! the router's reply path separately refuses to advertise peers farther
//! from the target than we are, which is how routing loops form.

use std::cmp::Reverse;
use std::collections::HashMap;

use tracing::debug;

use cairn_proto::node::{NodeAddress, NodeId};

/// One known peer.
#[derive(Clone, Debug)]
pub struct Node {
    /// The peer's 160-bit identifier.
    pub id: NodeId,
    /// Compact network address, updated on every sighting.
    pub address: NodeAddress,
    /// How useful this peer has been at shortening searches. 0 until it
    /// answers one, and again after it times out.
    pub reach: u32,
    /// Consecutive failed probes; reset by any reply.
    pub consecutive_timeouts: u32,
}

/// Ranking key for a candidate: `distance/reach`, scaled so integer
/// division loses nothing. Zero reach ranks behind every positive reach.
pub(crate) fn distance_reach_ratio(distance: u32, reach: u32) -> u128 {
    if reach == 0 {
        u128::MAX
    } else {
        (u128::from(distance) << 32) / u128::from(reach)
    }
}

/// Bounded table of known peers.
pub struct NodeStore {
    our_id: NodeId,
    capacity: usize,
    nodes: Vec<Node>,
    /// Index into `nodes` by full id.
    by_id: HashMap<NodeId, usize>,
}

impl NodeStore {
    /// Create an empty store for the given local id.
    pub fn new(our_id: NodeId, capacity: usize) -> Self {
        NodeStore {
            our_id,
            capacity,
            nodes: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// The local node id.
    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Record a sighting of a peer.
    ///
    /// A known id keeps its reach and timeout accounting and gets the new
    /// address. A new id is inserted with reach 0, evicting the weakest
    /// record when the store is full. Our own id is never stored.
    pub fn add(&mut self, id: NodeId, address: NodeAddress) {
        if id == self.our_id {
            return;
        }
        if let Some(&index) = self.by_id.get(&id) {
            self.nodes[index].address = address;
            return;
        }
        if self.nodes.len() >= self.capacity {
            self.evict_weakest();
        }
        self.by_id.insert(id, self.nodes.len());
        self.nodes.push(Node {
            id,
            address,
            reach: 0,
            consecutive_timeouts: 0,
        });
    }

    /// Look up a peer by id.
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.by_id.get(id).map(|&index| &self.nodes[index])
    }

    /// Look up a peer by id for mutation.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        match self.by_id.get(id) {
            Some(&index) => self.nodes.get_mut(index),
            None => None,
        }
    }

    /// Remove a peer from the store.
    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let index = self.by_id.remove(id)?;
        let node = self.nodes.swap_remove(index);
        if let Some(moved) = self.nodes.get(index) {
            self.by_id.insert(moved.id, index);
        }
        Some(node)
    }

    /// Our own opinion of our reach: the reach of the farthest-reaching
    /// peer we know.
    pub fn our_reach(&self) -> u32 {
        self.nodes.iter().map(|n| n.reach).max().unwrap_or(0)
    }

    /// The up-to-`k` peers most likely to shorten the path to `target`.
    ///
    /// A pure ranking over everything stored: ascending `distance/reach`
    /// ratio, ties broken by smaller XOR distance, then by larger reach.
    /// When no peer has positive reach the order therefore degenerates to
    /// pure XOR distance, which is what search seeding needs on a
    /// freshly seeded node.
    pub fn closest_nodes(&self, target: &NodeId, k: usize) -> Vec<Node> {
        let mut ranked: Vec<(&Node, u32)> = self
            .nodes
            .iter()
            .map(|n| (n, n.id.prefix_distance(target)))
            .collect();
        ranked.sort_by_key(|&(node, distance)| {
            (
                distance_reach_ratio(distance, node.reach),
                distance,
                Reverse(node.reach),
            )
        });
        ranked
            .into_iter()
            .take(k)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Age every reach value by `amount`, saturating at zero.
    pub fn decay(&mut self, amount: u32) {
        if amount == 0 {
            return;
        }
        for node in &mut self.nodes {
            node.reach = node.reach.saturating_sub(amount);
        }
    }

    /// Evict the record with the lowest reach; among equals, the one
    /// farthest from our own id goes.
    fn evict_weakest(&mut self) {
        let victim = self
            .nodes
            .iter()
            .min_by_key(|n| (n.reach, Reverse(n.id.prefix_distance(&self.our_id))))
            .map(|n| n.id);
        if let Some(id) = victim {
            debug!(node = %id, "evicting weakest node from full store");
            self.remove(&id);
        }
    }
}
