//! The search driver: timer-paced hop issuing, request timeouts, reach
//! decay and the periodic maintenance searches.
//!
//! Each search carries one reusable timer deadline. A search is Idle
//! until it starts, then awaits a reply with the deadline set two global
//! mean response times out; when the deadline passes without a reply the
//! next candidate is asked (one per tick) and the deadline re-arms. A
//! useful reply re-arms it too, so a healthy search never waits on the
//! timer. The search finalises when its callback says stop or the
//! candidates run out.

use tracing::debug;

use cairn_proto::message::{Message, QueryKind};
use cairn_proto::node::NodeId;

use crate::node_store::distance_reach_ratio;
use crate::router::{MessageBus, Router};

/// What the search owner wants after seeing a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchControl {
    /// Ask the next candidate.
    Continue,
    /// Finalise the search and credit the trace.
    Stop,
}

/// Per-reply callback owned by a search. Captured state lives and dies
/// with the search.
pub type SearchCallback = Box<dyn FnMut(&Message) -> SearchControl>;

/// Driver state attached to a live search.
pub(crate) struct SearchDriver {
    /// What kind of query this search sends.
    pub(crate) kind: QueryKind,
    /// Invoked once per useful reply.
    pub(crate) callback: SearchCallback,
    /// When to skip ahead to the next candidate.
    pub(crate) next_try_at: u64,
}

impl Router {
    /// Advance time: age reach, expire outstanding requests, fire search
    /// timers and run the maintenance jobs. Call this from the event
    /// loop; once a second is plenty, more often sharpens the pacing.
    pub fn tick<B: MessageBus>(&mut self, now_ms: u64, bus: &mut B) {
        self.decay_reach(now_ms);
        self.expire_requests(now_ms);
        self.fire_search_timers(now_ms, bus);
        self.run_maintenance(now_ms, bus);
    }

    fn decay_reach(&mut self, now_ms: u64) {
        let elapsed_seconds = now_ms.saturating_sub(self.last_decay_at) / 1000;
        if elapsed_seconds == 0 {
            return;
        }
        self.last_decay_at += elapsed_seconds * 1000;
        let per_second = self.config.reach_decrease_per_second;
        let amount = per_second.saturating_mul(elapsed_seconds.min(u64::from(u32::MAX)) as u32);
        self.node_store.decay(amount);
    }

    /// Zero the reach of peers sitting on a request past the hard
    /// timeout; repeat offenders leave the store entirely.
    fn expire_requests(&mut self, now_ms: u64) {
        let timeout_ms = self.config.search_timeout_seconds.saturating_mul(1000);
        let mut expired: Vec<NodeId> = Vec::new();
        for handle in self.search_store.live_handles() {
            let Some(search) = self.search_store.search_mut(handle) else {
                continue;
            };
            for node in &mut search.nodes {
                let Some(sent) = node.send_time else { continue };
                if node.replied || node.evicted || node.timed_out {
                    continue;
                }
                if now_ms.saturating_sub(sent) > timeout_ms {
                    node.timed_out = true;
                    expired.push(node.id);
                }
            }
        }
        for id in expired {
            self.penalize_timeout(&id);
        }
    }

    fn penalize_timeout(&mut self, id: &NodeId) {
        let Some(record) = self.node_store.get_mut(id) else {
            return;
        };
        record.reach = 0;
        record.consecutive_timeouts += 1;
        let strikes = record.consecutive_timeouts;
        if strikes >= self.config.max_timeouts {
            self.node_store.remove(id);
            debug!(node = %id, strikes, "removing peer after consecutive timeouts");
        } else {
            debug!(node = %id, strikes, "request timed out, reach zeroed");
        }
    }

    fn fire_search_timers<B: MessageBus>(&mut self, now_ms: u64, bus: &mut B) {
        for handle in self.search_store.live_handles() {
            let due = self
                .search_store
                .search(handle)
                .and_then(|s| s.driver.as_ref())
                .map(|d| d.next_try_at <= now_ms)
                .unwrap_or(false);
            if due {
                self.search_step(handle, now_ms, bus);
            }
        }
    }

    fn run_maintenance<B: MessageBus>(&mut self, now_ms: u64, bus: &mut B) {
        if now_ms >= self.next_local_maintenance_at {
            self.next_local_maintenance_at = now_ms
                + self
                    .config
                    .local_maintenance_search_period
                    .saturating_mul(1000);
            let target = NodeId::new(rand::random());
            self.local_maintenance_search(target, now_ms, bus);
        }
        if now_ms >= self.next_global_maintenance_at {
            self.next_global_maintenance_at = now_ms
                + self
                    .config
                    .global_maintenance_search_period
                    .saturating_mul(1000);
            self.global_maintenance_search(now_ms, bus);
        }
    }

    /// Search for a random target, skipped when we are the closest node
    /// to it by distance/reach. Early on no peer has proven reach, so
    /// the searches run freely and train our estimate; once the
    /// neighbourhood is known they taper off.
    pub(crate) fn local_maintenance_search<B: MessageBus>(
        &mut self,
        target: NodeId,
        now_ms: u64,
        bus: &mut B,
    ) {
        let Some(best) = self.node_store.closest_nodes(&target, 1).into_iter().next() else {
            return;
        };
        let our_ratio = distance_reach_ratio(
            self.my_id.prefix_distance(&target),
            self.node_store.our_reach(),
        );
        let best_ratio = distance_reach_ratio(best.id.prefix_distance(&target), best.reach);
        if our_ratio < best_ratio {
            // Our footprint covers this target; searching would only
            // flood.
            return;
        }
        debug!(search_target = %target, "starting local maintenance search");
        self.internal_search(target, now_ms, bus);
    }

    /// Re-run the most recent search we answered for someone else,
    /// giving zero-reach peers a chance to prove themselves.
    pub(crate) fn global_maintenance_search<B: MessageBus>(&mut self, now_ms: u64, bus: &mut B) {
        let Some(target) = self.last_serviced_target else {
            return;
        };
        debug!(search_target = %target, "re-running last serviced search");
        self.internal_search(target, now_ms, bus);
    }

    fn internal_search<B: MessageBus>(&mut self, target: NodeId, now_ms: u64, bus: &mut B) {
        let outcome = self.begin_search(
            QueryKind::FindNode,
            target,
            Box::new(|_| SearchControl::Continue),
            now_ms,
            bus,
        );
        if let Err(error) = outcome {
            debug!(error = %error, "maintenance search not started");
        }
    }
}
