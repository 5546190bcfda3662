//! The router: message handlers, search starts and reach attribution.
//!
//! Incoming replies feed the node store and the search that asked for
//! them; outgoing replies to other nodes' queries are decorated with the
//! best next hops we know. When a search finishes, every peer on the
//! winning back-trace is credited with reach proportional to how much
//! keyspace it advanced us through, discounted by how slowly it answered.

use tracing::debug;

use cairn_proto::bencode::Value;
use cairn_proto::message::{keys, Message, QueryKind};
use cairn_proto::node::{self, NodeAddress, NodeId};

use crate::average::{self, AverageRoller};
use crate::config::RouterConfig;
use crate::driver::{SearchCallback, SearchControl, SearchDriver};
use crate::node_store::{distance_reach_ratio, NodeStore};
use crate::search_store::{SearchHandle, SearchStore, TraceElement};
use crate::{
    DhtError, Result, GMRT_INITIAL_MILLISECONDS, GMRT_SECONDS, NODE_STORE_SIZE, RETURN_SIZE,
};

/// Sink for messages the router wants on the wire.
///
/// The surrounding application owns the socket; the router only queues.
/// Implementations must not call back into the router.
pub trait MessageBus {
    /// Queue one message for delivery to `destination`.
    fn dispatch(&mut self, destination: NodeAddress, message: Message);
}

/// The routing core. One per node, single-threaded; every entry point
/// runs to completion before the next begins.
pub struct Router {
    pub(crate) my_id: NodeId,
    pub(crate) config: RouterConfig,
    pub(crate) gmrt: AverageRoller,
    pub(crate) node_store: NodeStore,
    pub(crate) search_store: SearchStore,
    /// Target of the most recent query we answered; re-searched by the
    /// global maintenance job.
    pub(crate) last_serviced_target: Option<NodeId>,
    pub(crate) next_local_maintenance_at: u64,
    pub(crate) next_global_maintenance_at: u64,
    pub(crate) last_decay_at: u64,
}

impl Router {
    /// Create a router for the given local id. The clock starts at zero;
    /// both maintenance jobs first fire one full period in.
    pub fn new(my_id: NodeId, config: RouterConfig) -> Self {
        let next_local = config.local_maintenance_search_period.saturating_mul(1000);
        let next_global = config.global_maintenance_search_period.saturating_mul(1000);
        Router {
            my_id,
            config,
            gmrt: AverageRoller::new(GMRT_SECONDS, GMRT_INITIAL_MILLISECONDS),
            node_store: NodeStore::new(my_id, NODE_STORE_SIZE),
            search_store: SearchStore::new(),
            last_serviced_target: None,
            next_local_maintenance_at: next_local,
            next_global_maintenance_at: next_global,
            last_decay_at: 0,
        }
    }

    /// The local node id.
    pub fn my_id(&self) -> &NodeId {
        &self.my_id
    }

    /// Read access to the peer table.
    pub fn node_store(&self) -> &NodeStore {
        &self.node_store
    }

    /// Number of live searches.
    pub fn search_count(&self) -> usize {
        self.search_store.len()
    }

    /// The current global mean response time in milliseconds.
    pub fn gmrt(&self) -> u32 {
        self.gmrt.get()
    }

    /// Manually seed the peer table.
    pub fn add_node(&mut self, id: NodeId, address: NodeAddress) {
        self.node_store.add(id, address);
    }

    /// Start an iterative search for `target`.
    ///
    /// The search seeds itself from the store's best candidates, sends
    /// its first request immediately and then paces itself from
    /// [`tick`](Router::tick). The callback is invoked once per useful
    /// reply; returning [`SearchControl::Stop`] finalises the search.
    ///
    /// # Errors
    ///
    /// [`DhtError::NoCandidates`] when seeding yields nothing (the node
    /// store is empty); [`DhtError::TooManySearches`] when every search
    /// slot is live.
    pub fn begin_search<B: MessageBus>(
        &mut self,
        kind: QueryKind,
        target: NodeId,
        callback: SearchCallback,
        now_ms: u64,
        bus: &mut B,
    ) -> Result<()> {
        let handle = self.search_store.new_search(target)?;
        let seeds = self.node_store.closest_nodes(&target, RETURN_SIZE);
        if seeds.is_empty() {
            self.search_store.end_search(handle);
            return Err(DhtError::NoCandidates);
        }
        let evict_older_than = self.evict_unreplied_older_than(now_ms);
        for seed in &seeds {
            self.search_store
                .add_node(handle, None, seed.id, seed.address, evict_older_than);
        }
        if let Some(search) = self.search_store.search_mut(handle) {
            search.driver = Some(SearchDriver {
                kind,
                callback,
                next_try_at: now_ms,
            });
        }
        debug!(search_target = %target, seeds = seeds.len(), "beginning search");
        self.search_step(handle, now_ms, bus);
        Ok(())
    }

    /// Feed one incoming message to the router. Only replies are
    /// interesting; queries and errors are handled elsewhere.
    pub fn handle_incoming<B: MessageBus>(
        &mut self,
        message: &Message,
        source: NodeAddress,
        now_ms: u64,
        bus: &mut B,
    ) {
        if message.is_reply() {
            self.handle_reply(message, source, now_ms, bus);
        }
    }

    /// Stamp an outgoing message with our id and, when it answers an
    /// inbound query, decorate it with the best next hops for the
    /// query's target.
    pub fn handle_outgoing(
        &mut self,
        message: &mut Message,
        reply_to: Option<(&Message, NodeAddress)>,
    ) {
        let args_key = if reply_to.is_some() {
            keys::REPLY
        } else {
            keys::ARGUMENTS
        };
        message.put_nested(args_key, keys::MY_ID, self.my_id.as_bytes());
        if let Some((query, querier)) = reply_to {
            self.decorate_reply(message, query, querier);
        }
    }

    fn handle_reply<B: MessageBus>(
        &mut self,
        message: &Message,
        source: NodeAddress,
        now_ms: u64,
        bus: &mut B,
    ) {
        let Some(tid) = message.transaction_id() else {
            return;
        };
        let Some((handle, index)) = self.search_store.resolve_tid(tid) else {
            // Stale or forged; the search it belonged to is gone.
            debug!(source = %source, "dropping reply with unknown transaction id");
            return;
        };
        let Some(reply_args) = message.get_dict(keys::REPLY) else {
            return;
        };
        let already_replied = self
            .search_store
            .search(handle)
            .and_then(|s| s.node(index))
            .map(|n| n.replied)
            .unwrap_or(true);
        if already_replied {
            return;
        }

        self.search_store.reply_received(handle, index, now_ms);
        let peer_id = self
            .search_store
            .search(handle)
            .and_then(|s| s.node(index))
            .map(|n| n.id);
        if let Some(id) = peer_id {
            if let Some(record) = self.node_store.get_mut(&id) {
                record.consecutive_timeouts = 0;
            }
        }

        let peers = match reply_args
            .get(keys::NODES)
            .and_then(Value::as_bytes)
            .map(node::decode_nodes)
        {
            Some(Ok(peers)) => peers,
            _ => {
                // No usable node list; treat the reply as a ping answer.
                if let Some(sender) = reply_args.get(keys::MY_ID).and_then(Value::as_bytes) {
                    if let Ok(id) = NodeId::from_bytes(sender) {
                        self.node_store.add(id, source);
                    }
                }
                return;
            }
        };

        let evict_older_than = self.evict_unreplied_older_than(now_ms);
        for (id, address) in &peers {
            self.node_store.add(*id, *address);
            self.search_store
                .add_node(handle, Some(index), *id, *address, evict_older_than);
        }

        // Ask the search owner whether to keep going. The callback is
        // taken out of the search for the duration of the call.
        let Some(mut driver) = self
            .search_store
            .search_mut(handle)
            .and_then(|s| s.driver.take())
        else {
            return;
        };
        let control = (driver.callback)(message);
        if let Some(search) = self.search_store.search_mut(handle) {
            search.driver = Some(driver);
        }
        match control {
            SearchControl::Continue => self.search_step(handle, now_ms, bus),
            SearchControl::Stop => self.finalize_search(handle, Some(index), now_ms),
        }
    }

    /// Send the search's next request, or finalise when the candidates
    /// are exhausted.
    pub(crate) fn search_step<B: MessageBus>(
        &mut self,
        handle: SearchHandle,
        now_ms: u64,
        bus: &mut B,
    ) {
        let (target, kind, next, last_replied) = {
            let Some(search) = self.search_store.search(handle) else {
                return;
            };
            (
                search.target,
                search
                    .driver
                    .as_ref()
                    .map(|d| d.kind)
                    .unwrap_or(QueryKind::FindNode),
                search.next_node(),
                search.last_replied,
            )
        };
        let Some(index) = next else {
            self.finalize_search(handle, last_replied, now_ms);
            return;
        };
        let Some(address) = self
            .search_store
            .search(handle)
            .and_then(|s| s.node(index))
            .map(|n| n.address)
        else {
            return;
        };
        let Some(tid) = self.search_store.tid_for(handle, index) else {
            return;
        };
        self.send_request(kind, &tid, Some(&target), address, bus);
        self.search_store.request_sent(handle, index, now_ms);
        let deadline = now_ms + self.try_next_node_after();
        if let Some(driver) = self
            .search_store
            .search_mut(handle)
            .and_then(|s| s.driver.as_mut())
        {
            driver.next_try_at = deadline;
        }
    }

    /// Credit the back-trace and drop the search.
    fn finalize_search(&mut self, handle: SearchHandle, last_replied: Option<u16>, now_ms: u64) {
        if let Some(parent_index) = last_replied {
            self.attribute_reach(handle, parent_index, now_ms);
        }
        self.search_store.end_search(handle);
        debug!(live_searches = self.search_store.len(), "search finalised");
    }

    /// Walk the back-trace from the last replying peer to the original
    /// seed, crediting each parent with the keyspace distance it moved
    /// the search, discounted by its response-time ratio.
    fn attribute_reach(&mut self, handle: SearchHandle, parent_index: u16, now_ms: u64) {
        let Some(search) = self.search_store.search(handle) else {
            return;
        };
        let target = search.target;
        // Synthetic head standing in for the target itself, so reaching
        // the target is credited like reaching any intermediate peer.
        let mut trace = vec![TraceElement {
            id: target,
            reply_delay_ms: 0,
        }];
        trace.extend(search.back_trace(parent_index));

        let target_prefix = target.prefix();
        for pair in trace.windows(2) {
            let child = &pair[0];
            let parent = &pair[1];
            let Some(record) = self.node_store.get_mut(&parent.id) else {
                // Evicted from the store mid-search; nothing to credit.
                continue;
            };
            let gmrt = self.gmrt.update(now_ms, parent.reply_delay_ms);
            let ratio = average::response_time_ratio(gmrt, parent.reply_delay_ms).max(1);
            let helped = distance_helped(parent.id.prefix(), target_prefix, child.id.prefix());
            record.reach = record.reach.saturating_add(helped / ratio);
        }
    }

    fn decorate_reply(&mut self, reply: &mut Message, query: &Message, querier: NodeAddress) {
        let Some(query_args) = query.get_dict(keys::ARGUMENTS) else {
            return;
        };
        let Some(sender) = query_args.get(keys::MY_ID).and_then(Value::as_bytes) else {
            return;
        };
        let Ok(sender_id) = NodeId::from_bytes(sender) else {
            return;
        };
        self.node_store.add(sender_id, querier);

        let target_bytes = query_args
            .get(keys::TARGET)
            .and_then(Value::as_bytes)
            .or_else(|| query_args.get(keys::INFO_HASH).and_then(Value::as_bytes));
        let Some(target_bytes) = target_bytes else {
            return;
        };
        let Ok(target) = NodeId::from_bytes(target_bytes) else {
            return;
        };
        self.last_serviced_target = Some(target);

        // A reply must never advertise a peer farther from the target
        // than we are; that is how routing loops form.
        let our_distance = self.my_id.prefix_distance(&target);
        let mut candidates = self.node_store.closest_nodes(&target, RETURN_SIZE);
        candidates.retain(|n| n.id.prefix_distance(&target) < our_distance);
        if candidates.is_empty() {
            return;
        }
        let our_reach = self.node_store.our_reach();
        if our_reach > 0 {
            let our_ratio = distance_reach_ratio(self.my_id.prefix_distance(&target), our_reach);
            let best_peer_ratio = candidates
                .iter()
                .filter(|n| n.reach > 0)
                .map(|n| distance_reach_ratio(n.id.prefix_distance(&target), n.reach))
                .min();
            match best_peer_ratio {
                Some(ratio) if ratio <= our_ratio => {}
                // We are the closest reaching node for this target.
                // Advertising hops we can beat would invite routing
                // loops, so the reply carries no nodes at all.
                _ => return,
            }
        }

        let records: Vec<(NodeId, NodeAddress)> =
            candidates.iter().map(|n| (n.id, n.address)).collect();
        reply.put_nested(keys::REPLY, keys::NODES, &node::encode_nodes(&records));
    }

    /// Build and dispatch one query. Pings carry no target.
    pub(crate) fn send_request<B: MessageBus>(
        &self,
        kind: QueryKind,
        tid: &[u8],
        target: Option<&NodeId>,
        destination: NodeAddress,
        bus: &mut B,
    ) {
        let mut message = Message::new();
        message.put_string(keys::TRANSACTION_ID, tid);
        message.put_string(keys::MESSAGE_TYPE, keys::QUERY);
        message.put_string(keys::QUERY, kind.wire_name());
        message.put_nested(keys::ARGUMENTS, keys::MY_ID, self.my_id.as_bytes());
        if let (Some(target), Some(key)) = (target, kind.target_key()) {
            message.put_nested(keys::ARGUMENTS, key, target.as_bytes());
        }
        bus.dispatch(destination, message);
    }

    /// How long to wait before skipping ahead to the next candidate:
    /// twice the global mean response time.
    pub(crate) fn try_next_node_after(&self) -> u64 {
        2 * u64::from(self.gmrt.get())
    }

    /// Unreplied requests older than this are dropped from candidate
    /// tries.
    pub(crate) fn evict_unreplied_older_than(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(2 * u64::from(self.gmrt.get()))
    }
}

/// How much closer to `target` did `node`'s reply naming `reply` move
/// us, on 32-bit prefixes.
///
/// A reply farther from the target than the peer itself scores zero (the
/// peer is backpedalling). A reply that overshoots past the target
/// scores as if it had undershot by the same amount, so wild guesses far
/// beyond the target are not rewarded. Otherwise the score is simply the
/// keyspace covered between peer and reply.
pub(crate) fn distance_helped(node_prefix: u32, target_prefix: u32, reply_prefix: u32) -> u32 {
    let at = node_prefix ^ target_prefix;
    let bt = reply_prefix ^ target_prefix;
    if bt > at {
        return 0;
    }
    let ab = node_prefix ^ reply_prefix;
    if at < ab {
        return ab - bt;
    }
    ab
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct VecBus {
        pub sent: Vec<(NodeAddress, Message)>,
    }

    impl VecBus {
        pub(crate) fn new() -> Self {
            VecBus { sent: Vec::new() }
        }
    }

    impl MessageBus for VecBus {
        fn dispatch(&mut self, destination: NodeAddress, message: Message) {
            self.sent.push((destination, message));
        }
    }

    pub(crate) fn id(prefix: u32) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&prefix.to_be_bytes());
        NodeId::new(bytes)
    }

    pub(crate) fn addr(octet: u8) -> NodeAddress {
        NodeAddress::new([10, 0, 0, octet, 0x1F, 0x90])
    }

    pub(crate) fn router() -> Router {
        Router::new(id(0xFFFF_FFFF), RouterConfig::default())
    }

    fn reply_to(request: &Message, sender: NodeId, peers: &[(NodeId, NodeAddress)]) -> Message {
        let mut reply = Message::new();
        let tid = request.transaction_id().expect("request has tid");
        reply.put_string(keys::TRANSACTION_ID, tid);
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        reply.put_nested(keys::REPLY, keys::MY_ID, sender.as_bytes());
        reply.put_nested(keys::REPLY, keys::NODES, &node::encode_nodes(peers));
        reply
    }

    #[test]
    fn test_distance_helped_overshoot() {
        // at = 0xAAAAAAAA, bt = 0x55555555, ab = 0xFFFFFFFF: overshoot.
        assert_eq!(
            distance_helped(0xAAAA_AAAA, 0x0000_0000, 0x5555_5555),
            0xAAAA_AAAA
        );
    }

    #[test]
    fn test_distance_helped_backpedal() {
        assert_eq!(distance_helped(0x1000_0000, 0x0000_0000, 0x2000_0000), 0);
    }

    #[test]
    fn test_distance_helped_between() {
        // Reply between the peer and the target: score is peer-to-reply.
        assert_eq!(
            distance_helped(0x8000_0000, 0x0000_0000, 0x2000_0000),
            0xA000_0000
        );
    }

    #[test]
    fn test_distance_helped_bounded_by_ab() {
        let samples = [
            (0xAAAA_AAAAu32, 0x0000_0000u32, 0x5555_5555u32),
            (0x8000_0000, 0x0000_0000, 0x2000_0000),
            (0x1234_5678, 0x8765_4321, 0xDEAD_BEEF),
            (0xFFFF_FFFF, 0x0000_0001, 0x7FFF_FFFF),
            (0, 0, 0),
        ];
        for (node, target, reply) in samples {
            let helped = distance_helped(node, target, reply);
            assert!(helped <= node ^ reply, "helped exceeds ab for {node:x}");
        }
    }

    #[test]
    fn test_distance_helped_backpedal_is_always_zero() {
        for (node, target) in [(0x10u32, 0u32), (0xF000_0000, 0x0F00_0000), (7, 9)] {
            let at = node ^ target;
            // Any reply at or beyond the peer's own distance scores zero
            // when strictly farther.
            for extra in [1u32, 2, 1000] {
                let bt = at.saturating_add(extra);
                let reply = bt ^ target;
                if reply ^ target > at {
                    assert_eq!(distance_helped(node, target, reply), 0);
                }
            }
        }
    }

    #[test]
    fn test_begin_search_with_empty_store_fails() {
        let mut router = router();
        let mut bus = VecBus::new();
        let result = router.begin_search(
            QueryKind::FindNode,
            id(0),
            Box::new(|_| SearchControl::Continue),
            0,
            &mut bus,
        );
        assert!(matches!(result, Err(DhtError::NoCandidates)));
        assert!(bus.sent.is_empty());
        assert_eq!(router.search_count(), 0);
    }

    #[test]
    fn test_begin_search_asks_the_best_seed_first() {
        let mut router = router();
        let mut bus = VecBus::new();
        router.add_node(id(0x9000_0000), addr(2));
        router.add_node(id(0x8000_0000), addr(1));

        router
            .begin_search(
                QueryKind::FindNode,
                id(0),
                Box::new(|_| SearchControl::Continue),
                0,
                &mut bus,
            )
            .expect("search starts");

        assert_eq!(router.search_count(), 1);
        assert_eq!(bus.sent.len(), 1);
        let (destination, request) = &bus.sent[0];
        assert_eq!(*destination, addr(1));
        assert_eq!(request.query_name(), Some(&b"find_node"[..]));
        assert_eq!(
            request.get_nested(keys::ARGUMENTS, keys::TARGET),
            Some(id(0).as_bytes().as_slice())
        );
        assert_eq!(
            request.get_nested(keys::ARGUMENTS, keys::MY_ID),
            Some(router.my_id().as_bytes().as_slice())
        );
    }

    #[test]
    fn test_begin_search_seeds_even_when_every_peer_is_farther_than_us() {
        // Seeding is a pure ranking; sitting nearest the target
        // ourselves is no reason not to ask the network.
        let mut router = Router::new(id(0x0000_0001), RouterConfig::default());
        let mut bus = VecBus::new();
        let far = id(0x8000_0000);
        router.add_node(far, addr(1));

        router
            .begin_search(
                QueryKind::FindNode,
                id(0),
                Box::new(|_| SearchControl::Continue),
                0,
                &mut bus,
            )
            .expect("search starts");

        assert_eq!(router.search_count(), 1);
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(bus.sent[0].0, addr(1));
    }

    #[test]
    fn test_reply_advances_to_closest_new_candidate() {
        let mut router = router();
        let mut bus = VecBus::new();
        let a = id(0x8000_0000);
        let b = id(0x9000_0000);
        router.add_node(a, addr(1));
        router.add_node(b, addr(2));
        router
            .begin_search(
                QueryKind::FindNode,
                id(0),
                Box::new(|_| SearchControl::Continue),
                0,
                &mut bus,
            )
            .expect("search starts");

        // A replies naming C and D, both closer than B.
        let c = id(0x2000_0000);
        let d = id(0x4000_0000);
        let reply = reply_to(&bus.sent[0].1, a, &[(c, addr(3)), (d, addr(4))]);
        router.handle_incoming(&reply, addr(1), 50, &mut bus);

        assert_eq!(bus.sent.len(), 2, "one follow-up request");
        assert_eq!(bus.sent[1].0, addr(3), "C is the closest unvisited");
        assert!(router.node_store().get(&c).is_some());
        assert!(router.node_store().get(&d).is_some());
    }

    #[test]
    fn test_stale_tid_is_dropped() {
        let mut router = router();
        let mut bus = VecBus::new();
        let mut reply = Message::new();
        reply.put_string(keys::TRANSACTION_ID, &[9, 9, 9, 9, 9, 9]);
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        reply.put_nested(keys::REPLY, keys::MY_ID, id(0x1234).as_bytes());
        router.handle_incoming(&reply, addr(7), 10, &mut bus);
        assert!(bus.sent.is_empty());
        assert!(router.node_store().is_empty());
    }

    #[test]
    fn test_non_reply_messages_are_ignored() {
        let mut router = router();
        let mut bus = VecBus::new();
        let mut query = Message::new();
        query.put_string(keys::MESSAGE_TYPE, keys::QUERY);
        query.put_string(keys::QUERY, b"find_node");
        router.handle_incoming(&query, addr(7), 10, &mut bus);
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn test_malformed_nodes_treated_as_ping_answer() {
        let mut router = router();
        let mut bus = VecBus::new();
        let a = id(0x8000_0000);
        router.add_node(a, addr(1));
        router
            .begin_search(
                QueryKind::FindNode,
                id(0),
                Box::new(|_| SearchControl::Continue),
                0,
                &mut bus,
            )
            .expect("search starts");

        let mut reply = Message::new();
        let tid = bus.sent[0].1.transaction_id().expect("tid").to_vec();
        reply.put_string(keys::TRANSACTION_ID, &tid);
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        reply.put_nested(keys::REPLY, keys::MY_ID, a.as_bytes());
        // 27 bytes: not a whole number of records.
        reply.put_nested(keys::REPLY, keys::NODES, &[0u8; 27]);
        router.handle_incoming(&reply, addr(1), 40, &mut bus);

        // The sender was recorded, the search did not advance.
        assert!(router.node_store().get(&a).is_some());
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(router.search_count(), 1);
    }

    #[test]
    fn test_search_stop_attributes_reach_along_the_trace() {
        let mut router = router();
        let mut bus = VecBus::new();
        let a = id(0xF000_0000);
        let c = id(0xA000_0000);
        let d = id(0x6000_0000);
        router.add_node(a, addr(1));

        // Stop on the third useful reply.
        let mut replies = 0u32;
        router
            .begin_search(
                QueryKind::FindNode,
                id(0),
                Box::new(move |_| {
                    replies += 1;
                    if replies >= 3 {
                        SearchControl::Stop
                    } else {
                        SearchControl::Continue
                    }
                }),
                0,
                &mut bus,
            )
            .expect("search starts");

        let reply_a = reply_to(&bus.sent[0].1, a, &[(c, addr(3))]);
        router.handle_incoming(&reply_a, addr(1), 10, &mut bus);
        let reply_c = reply_to(&bus.sent[1].1, c, &[(d, addr(4))]);
        router.handle_incoming(&reply_c, addr(3), 20, &mut bus);
        let reply_d = reply_to(&bus.sent[2].1, d, &[]);
        router.handle_incoming(&reply_d, addr(4), 30, &mut bus);

        assert_eq!(router.search_count(), 0, "search finalised");
        let reach_a = router.node_store().get(&a).expect("a present").reach;
        let reach_c = router.node_store().get(&c).expect("c present").reach;
        let reach_d = router.node_store().get(&d).expect("d present").reach;
        assert!(reach_a > 0, "seed credited");
        assert!(reach_c > 0, "middle hop credited");
        assert!(reach_d > 0, "final hop credited");
    }

    #[test]
    fn test_attribution_skips_evicted_parents() {
        let mut router = router();
        let mut bus = VecBus::new();
        let a = id(0xF000_0000);
        let c = id(0xA000_0000);
        let d = id(0x6000_0000);
        router.add_node(a, addr(1));

        let mut replies = 0u32;
        router
            .begin_search(
                QueryKind::FindNode,
                id(0),
                Box::new(move |_| {
                    replies += 1;
                    if replies >= 3 {
                        SearchControl::Stop
                    } else {
                        SearchControl::Continue
                    }
                }),
                0,
                &mut bus,
            )
            .expect("search starts");

        let reply_a = reply_to(&bus.sent[0].1, a, &[(c, addr(3))]);
        router.handle_incoming(&reply_a, addr(1), 10, &mut bus);
        let reply_c = reply_to(&bus.sent[1].1, c, &[(d, addr(4))]);
        router.handle_incoming(&reply_c, addr(3), 20, &mut bus);

        // A disappears from the store before the search completes.
        router.node_store.remove(&a);

        let reply_d = reply_to(&bus.sent[2].1, d, &[]);
        router.handle_incoming(&reply_d, addr(4), 30, &mut bus);

        assert!(router.node_store().get(&a).is_none());
        assert!(router.node_store().get(&c).expect("c present").reach > 0);
        assert!(router.node_store().get(&d).expect("d present").reach > 0);
    }

    #[test]
    fn test_duplicate_reply_is_ignored() {
        let mut router = router();
        let mut bus = VecBus::new();
        let a = id(0x8000_0000);
        router.add_node(a, addr(1));
        router
            .begin_search(
                QueryKind::FindNode,
                id(0),
                Box::new(|_| SearchControl::Continue),
                0,
                &mut bus,
            )
            .expect("search starts");

        let c = id(0x2000_0000);
        let reply = reply_to(&bus.sent[0].1, a, &[(c, addr(3))]);
        router.handle_incoming(&reply, addr(1), 10, &mut bus);
        let sent_after_first = bus.sent.len();
        router.handle_incoming(&reply, addr(1), 15, &mut bus);
        assert_eq!(bus.sent.len(), sent_after_first, "replay changed nothing");
    }

    fn find_node_query(sender: NodeId, target: NodeId) -> Message {
        let mut query = Message::new();
        query.put_string(keys::TRANSACTION_ID, b"qq");
        query.put_string(keys::MESSAGE_TYPE, keys::QUERY);
        query.put_string(keys::QUERY, b"find_node");
        query.put_nested(keys::ARGUMENTS, keys::MY_ID, sender.as_bytes());
        query.put_nested(keys::ARGUMENTS, keys::TARGET, target.as_bytes());
        query
    }

    #[test]
    fn test_outgoing_reply_is_tagged_and_decorated() {
        let mut router = router();
        let near = id(0x0000_0010);
        router.add_node(near, addr(1));

        let querier = id(0x7777_7777);
        let query = find_node_query(querier, id(0));
        let mut reply = Message::new();
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        router.handle_outgoing(&mut reply, Some((&query, addr(9))));

        assert_eq!(
            reply.get_nested(keys::REPLY, keys::MY_ID),
            Some(router.my_id().as_bytes().as_slice())
        );
        let blob = reply
            .get_nested(keys::REPLY, keys::NODES)
            .expect("nodes present");
        let peers = node::decode_nodes(blob).expect("well-formed");
        assert_eq!(peers[0].0, near);
        // The querier itself was recorded.
        assert!(router.node_store().get(&querier).is_some());
    }

    #[test]
    fn test_outgoing_reply_only_offers_nodes_closer_than_us() {
        let mut router = Router::new(id(0x0000_0100), RouterConfig::default());
        router.add_node(id(0x8000_0000), addr(1)); // farther than us
        router.add_node(id(0x0000_0010), addr(2)); // closer than us

        let query = find_node_query(id(0x7777_7777), id(0));
        let mut reply = Message::new();
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        router.handle_outgoing(&mut reply, Some((&query, addr(9))));

        let blob = reply
            .get_nested(keys::REPLY, keys::NODES)
            .expect("nodes present");
        let peers = node::decode_nodes(blob).expect("well-formed");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, id(0x0000_0010));
        let our_distance = router.my_id().prefix_distance(&id(0));
        for (peer, _) in peers {
            assert!(peer.prefix_distance(&id(0)) < our_distance);
        }
    }

    #[test]
    fn test_outgoing_reply_empty_when_no_peer_is_closer() {
        let mut router = Router::new(id(0x0000_0100), RouterConfig::default());
        router.add_node(id(0x8000_0000), addr(1));

        let query = find_node_query(id(0x7777_7777), id(0));
        let mut reply = Message::new();
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        router.handle_outgoing(&mut reply, Some((&query, addr(9))));

        assert!(reply.get_nested(keys::REPLY, keys::NODES).is_none());
        assert!(reply.get_nested(keys::REPLY, keys::MY_ID).is_some());
    }

    #[test]
    fn test_outgoing_reply_empty_when_we_are_closest_reaching() {
        let mut router = Router::new(id(0x0000_0100), RouterConfig::default());
        // A far peer with high reach defines our own reach opinion; the
        // only closer peer has none.
        router.add_node(id(0x8000_0000), addr(1));
        router.add_node(id(0x0000_0010), addr(2));
        router
            .node_store
            .get_mut(&id(0x8000_0000))
            .expect("present")
            .reach = 1_000;

        let query = find_node_query(id(0x7777_7777), id(0));
        let mut reply = Message::new();
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        router.handle_outgoing(&mut reply, Some((&query, addr(9))));

        assert!(
            reply.get_nested(keys::REPLY, keys::NODES).is_none(),
            "no hops we cannot beat"
        );
        // Our id still tags the reply.
        assert!(reply.get_nested(keys::REPLY, keys::MY_ID).is_some());
    }

    #[test]
    fn test_outgoing_reply_without_target_is_left_plain() {
        let mut router = router();
        router.add_node(id(0x10), addr(1));
        let mut query = Message::new();
        query.put_string(keys::MESSAGE_TYPE, keys::QUERY);
        query.put_string(keys::QUERY, b"ping");
        query.put_nested(keys::ARGUMENTS, keys::MY_ID, id(0x7777_7777).as_bytes());
        let mut reply = Message::new();
        reply.put_string(keys::MESSAGE_TYPE, keys::REPLY);
        router.handle_outgoing(&mut reply, Some((&query, addr(9))));

        assert!(reply.get_nested(keys::REPLY, keys::NODES).is_none());
        assert!(reply.get_nested(keys::REPLY, keys::MY_ID).is_some());
    }

    #[test]
    fn test_outgoing_query_gets_id_under_arguments() {
        let mut router = router();
        let mut ping = Message::new();
        ping.put_string(keys::MESSAGE_TYPE, keys::QUERY);
        ping.put_string(keys::QUERY, b"ping");
        router.handle_outgoing(&mut ping, None);
        assert_eq!(
            ping.get_nested(keys::ARGUMENTS, keys::MY_ID),
            Some(router.my_id().as_bytes().as_slice())
        );
    }

    #[test]
    fn test_get_peers_search_sends_info_hash() {
        let mut router = router();
        let mut bus = VecBus::new();
        router.add_node(id(0x8000_0000), addr(1));
        router
            .begin_search(
                QueryKind::GetPeers,
                id(0x42),
                Box::new(|_| SearchControl::Continue),
                0,
                &mut bus,
            )
            .expect("search starts");
        let request = &bus.sent[0].1;
        assert_eq!(request.query_name(), Some(&b"get_peers"[..]));
        assert_eq!(
            request.get_nested(keys::ARGUMENTS, keys::INFO_HASH),
            Some(id(0x42).as_bytes().as_slice())
        );
        assert!(request.get_nested(keys::ARGUMENTS, keys::TARGET).is_none());
    }
}
