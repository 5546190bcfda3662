//! # cairn-dht
//!
//! Routing and search core of the Cairn DHT node.
//!
//! Unlike textbook Kademlia, this router does not partition peers into
//! fixed-width buckets or ping a random node per bucket. Every known peer
//! carries a continuous **reach** number derived from measured
//! responsiveness, and next hops are chosen by minimising the
//! **distance/reach** ratio to the search target. Peers that time out get
//! their reach zeroed, so dead nodes are ignored without being forgotten;
//! new peers start at reach 0 and earn it by answering searches.
//!
//! Picturing a peer as an area centred on its keyspace position and sized
//! by its reach, a record can be closer in raw keyspace to one peer while
//! still lying deeper inside another's footprint:
//!
//! ```text
//! |<--------- peer 1 ---------->|
//!                      |<--- peer 2 ---->|
//!                         ^----- record location
//! ```
//!
//! Here peer 1 is the better next hop despite peer 2 being nearer.
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | GMRT window | 256 seconds |
//! | GMRT initial sample | 100 ms |
//! | Node store capacity | 16384 |
//! | K (reply / seed set size) | 8 |
//! | Concurrent searches | 256 |
//!
//! The core is synchronous and performs no I/O of its own: incoming
//! messages are pushed into [`router::Router::handle_incoming`], outgoing
//! messages leave through the [`router::MessageBus`] trait, and timers are
//! driven by calling [`router::Router::tick`] from the surrounding event
//! loop. Clock values are milliseconds from an arbitrary epoch chosen at
//! startup.

pub mod average;
pub mod config;
pub mod driver;
pub mod node_store;
pub mod router;
pub mod search_store;

/// Seconds of history in the global mean response time average.
pub const GMRT_SECONDS: u64 = 256;

/// Seed sample for the response-time average so that early decisions are
/// not divided by zero.
pub const GMRT_INITIAL_MILLISECONDS: u32 = 100;

/// Maximum number of peers in the node store.
pub const NODE_STORE_SIZE: usize = 16384;

/// Number of nodes returned in a reply and used to seed a search.
pub const RETURN_SIZE: usize = 8;

/// Maximum number of concurrently live searches.
pub const MAX_SEARCHES: usize = 256;

/// Error types for routing operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// A search could not start because seeding yielded no candidates.
    /// Seed the store and retry.
    #[error("no candidates to seed a search with")]
    NoCandidates,

    /// Every search slot is live.
    #[error("too many concurrent searches (max {max})")]
    TooManySearches {
        /// The configured slot count.
        max: usize,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience result type for routing operations.
pub type Result<T> = std::result::Result<T, DhtError>;
