//! In-flight iterative searches and their contacted-node tries.
//!
//! Each live search owns the nodes it has heard about, linked by parent
//! pointers: a node's parent is the peer whose reply introduced it (seeds
//! have none). Following parents from any node reaches a seed; that chain
//! is the back-trace the router walks when it attributes reach after a
//! search completes.
//!
//! Every node is addressed by the transaction id its request was (or
//! would be) sent with. A tid encodes the search slot, the slot's
//! generation and the node index, so a tid is a bijection with live
//! nodes and a reply to a finished search resolves to nothing even after
//! its slot has been reused.

use tracing::debug;

use cairn_proto::node::{NodeAddress, NodeId};

use crate::driver::SearchDriver;
use crate::{DhtError, Result, MAX_SEARCHES};

/// Upper bound on nodes tracked per search.
pub(crate) const MAX_SEARCH_NODES: usize = 512;

/// Length of a transaction id in bytes: slot, generation, node index.
pub const TID_LEN: usize = 6;

/// Handle to a live search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SearchHandle(pub(crate) u16);

/// One element of a back-trace, deepest first.
#[derive(Clone, Debug)]
pub struct TraceElement {
    /// The peer (or, for the synthetic head, the search target).
    pub id: NodeId,
    /// How long the peer took to reply.
    pub reply_delay_ms: u32,
}

/// One contacted (or yet-to-be-contacted) peer within a search.
#[derive(Clone, Debug)]
pub struct SearchNode {
    /// The peer's id.
    pub id: NodeId,
    /// Where its request is sent.
    pub address: NodeAddress,
    /// Index of the node whose reply introduced this one; `None` for
    /// seeds.
    pub parent: Option<u16>,
    /// When the request went out; `None` while still a candidate.
    pub send_time: Option<u64>,
    /// Measured reply latency; 0 until the reply arrives.
    pub reply_delay_ms: u32,
    /// Whether the peer has replied.
    pub replied: bool,
    /// Dropped from the candidate set (stale unreplied request).
    pub evicted: bool,
    /// Already penalised for exceeding the request timeout.
    pub timed_out: bool,
}

/// A live iterative search.
pub struct Search {
    pub(crate) target: NodeId,
    pub(crate) nodes: Vec<SearchNode>,
    /// Index of the most recent node to reply.
    pub(crate) last_replied: Option<u16>,
    /// Driver state: request kind, callback, next timer deadline.
    pub(crate) driver: Option<SearchDriver>,
    generation: u16,
}

impl Search {
    /// The id this search is converging on.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Access a node by index.
    pub fn node(&self, index: u16) -> Option<&SearchNode> {
        self.nodes.get(usize::from(index))
    }

    pub(crate) fn node_mut(&mut self, index: u16) -> Option<&mut SearchNode> {
        self.nodes.get_mut(usize::from(index))
    }

    /// Append a node under `parent`, first dropping from the candidate
    /// set every node whose request is older than `evict_older_than` and
    /// still unanswered. Returns the new node's index, or `None` when
    /// the id is already tracked by this search.
    pub(crate) fn add_node(
        &mut self,
        parent: Option<u16>,
        id: NodeId,
        address: NodeAddress,
        evict_older_than: u64,
    ) -> Option<u16> {
        for node in &mut self.nodes {
            if let Some(sent) = node.send_time {
                if !node.replied && !node.evicted && sent < evict_older_than {
                    node.evicted = true;
                }
            }
        }
        if self
            .nodes
            .iter()
            .any(|n| !n.evicted && n.id == id)
        {
            return None;
        }
        if self.nodes.len() >= MAX_SEARCH_NODES {
            debug!(search_target = %self.target, "search node table full, dropping candidate");
            return None;
        }
        let index = self.nodes.len() as u16;
        self.nodes.push(SearchNode {
            id,
            address,
            parent,
            send_time: None,
            reply_delay_ms: 0,
            replied: false,
            evicted: false,
            timed_out: false,
        });
        Some(index)
    }

    /// The unvisited candidate nearest the target by full-width XOR
    /// distance.
    pub(crate) fn next_node(&self) -> Option<u16> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.evicted && n.send_time.is_none())
            .min_by_key(|(_, n)| n.id.distance(&self.target))
            .map(|(index, _)| index as u16)
    }

    /// The trace from `from` back to a seed, deepest first.
    pub fn back_trace(&self, from: u16) -> Vec<TraceElement> {
        let mut trace = Vec::new();
        let mut cursor = Some(from);
        while let Some(index) = cursor {
            let Some(node) = self.node(index) else { break };
            trace.push(TraceElement {
                id: node.id,
                reply_delay_ms: node.reply_delay_ms,
            });
            cursor = node.parent;
        }
        trace
    }
}

struct Slot {
    generation: u16,
    search: Option<Search>,
}

/// The set of live searches.
pub struct SearchStore {
    slots: Vec<Slot>,
    max_searches: usize,
}

impl SearchStore {
    /// Create an empty store.
    pub fn new() -> Self {
        SearchStore {
            slots: Vec::new(),
            max_searches: MAX_SEARCHES,
        }
    }

    /// Number of live searches.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.search.is_some()).count()
    }

    /// Whether any search is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a search slot.
    pub fn new_search(&mut self, target: NodeId) -> Result<SearchHandle> {
        let slot_index = match self.slots.iter().position(|s| s.search.is_none()) {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.max_searches {
                    return Err(DhtError::TooManySearches {
                        max: self.max_searches,
                    });
                }
                self.slots.push(Slot {
                    generation: 0,
                    search: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[slot_index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.search = Some(Search {
            target,
            nodes: Vec::new(),
            last_replied: None,
            driver: None,
            generation: slot.generation,
        });
        Ok(SearchHandle(slot_index as u16))
    }

    /// Access a live search.
    pub fn search(&self, handle: SearchHandle) -> Option<&Search> {
        self.slots
            .get(usize::from(handle.0))
            .and_then(|s| s.search.as_ref())
    }

    /// Access a live search for mutation.
    pub fn search_mut(&mut self, handle: SearchHandle) -> Option<&mut Search> {
        self.slots
            .get_mut(usize::from(handle.0))
            .and_then(|s| s.search.as_mut())
    }

    /// Drop a search and everything it owns: nodes, tids, callback and
    /// timer state die together.
    pub fn end_search(&mut self, handle: SearchHandle) {
        if let Some(slot) = self.slots.get_mut(usize::from(handle.0)) {
            slot.search = None;
        }
    }

    /// Handles of all live searches.
    pub fn live_handles(&self) -> Vec<SearchHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.search.is_some())
            .map(|(index, _)| SearchHandle(index as u16))
            .collect()
    }

    /// See [`Search::add_node`].
    pub fn add_node(
        &mut self,
        handle: SearchHandle,
        parent: Option<u16>,
        id: NodeId,
        address: NodeAddress,
        evict_older_than: u64,
    ) -> Option<u16> {
        self.search_mut(handle)?
            .add_node(parent, id, address, evict_older_than)
    }

    /// See [`Search::next_node`].
    pub fn next_node(&self, handle: SearchHandle) -> Option<u16> {
        self.search(handle)?.next_node()
    }

    /// The transaction id addressing a node of a live search.
    pub fn tid_for(&self, handle: SearchHandle, index: u16) -> Option<[u8; TID_LEN]> {
        let search = self.search(handle)?;
        search.node(index)?;
        let mut tid = [0u8; TID_LEN];
        tid[..2].copy_from_slice(&handle.0.to_be_bytes());
        tid[2..4].copy_from_slice(&search.generation.to_be_bytes());
        tid[4..].copy_from_slice(&index.to_be_bytes());
        Some(tid)
    }

    /// Resolve an incoming reply's tid to its search node. Stale or
    /// forged tids (wrong length, dead slot, old generation, evicted
    /// node) resolve to nothing.
    pub fn resolve_tid(&self, tid: &[u8]) -> Option<(SearchHandle, u16)> {
        let tid: &[u8; TID_LEN] = tid.try_into().ok()?;
        let slot_index = u16::from_be_bytes([tid[0], tid[1]]);
        let generation = u16::from_be_bytes([tid[2], tid[3]]);
        let index = u16::from_be_bytes([tid[4], tid[5]]);
        let handle = SearchHandle(slot_index);
        let search = self.search(handle)?;
        if search.generation != generation {
            return None;
        }
        let node = search.node(index)?;
        if node.evicted {
            return None;
        }
        Some((handle, index))
    }

    /// Record that a request went out to a node.
    pub fn request_sent(&mut self, handle: SearchHandle, index: u16, now_ms: u64) {
        if let Some(node) = self.search_mut(handle).and_then(|s| s.node_mut(index)) {
            node.send_time = Some(now_ms);
        }
    }

    /// Record a node's reply: marks it replied, measures the delay and
    /// remembers it as the search's most recent responder.
    pub fn reply_received(&mut self, handle: SearchHandle, index: u16, now_ms: u64) {
        let Some(search) = self.search_mut(handle) else {
            return;
        };
        if let Some(node) = search.node_mut(index) {
            let sent = node.send_time.unwrap_or(now_ms);
            node.reply_delay_ms = now_ms.saturating_sub(sent).min(u64::from(u32::MAX)) as u32;
            node.replied = true;
        }
        search.last_replied = Some(index);
    }
}

impl Default for SearchStore {
    fn default() -> Self {
        Self::new()
    }
}
