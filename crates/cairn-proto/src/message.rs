//! The top-level DHT message dictionary.
//!
//! [`Message`] wraps one bencoded dictionary and exposes the narrow
//! accessor set the routing core manipulates messages through:
//! get/put byte string and get/put sub-dictionary, plus typed helpers
//! for the handful of well-known keys.

use std::collections::BTreeMap;

use crate::bencode::{self, Value};
use crate::{Result, WireError};

/// Well-known dictionary keys and values.
pub mod keys {
    /// Transaction id.
    pub const TRANSACTION_ID: &[u8] = b"t";
    /// Message type: query / reply / error.
    pub const MESSAGE_TYPE: &[u8] = b"y";
    /// Query name (also the type tag value for queries).
    pub const QUERY: &[u8] = b"q";
    /// Query arguments dictionary.
    pub const ARGUMENTS: &[u8] = b"a";
    /// Reply arguments dictionary (also the type tag value for replies).
    pub const REPLY: &[u8] = b"r";
    /// Message type tag for errors.
    pub const ERROR: &[u8] = b"e";
    /// Sender node id, inside `a` or `r`.
    pub const MY_ID: &[u8] = b"id";
    /// Search target, inside `a`.
    pub const TARGET: &[u8] = b"target";
    /// Alternate search-target key used by get_peers.
    pub const INFO_HASH: &[u8] = b"info_hash";
    /// Compact node records, inside `r`.
    pub const NODES: &[u8] = b"nodes";
}

/// The query kinds the router sends and answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// Address probe; carries no search target.
    Ping,
    /// Locate nodes near a target id.
    FindNode,
    /// Locate peers for an info hash.
    GetPeers,
}

impl QueryKind {
    /// The wire name of this query.
    pub fn wire_name(&self) -> &'static [u8] {
        match self {
            QueryKind::Ping => b"ping",
            QueryKind::FindNode => b"find_node",
            QueryKind::GetPeers => b"get_peers",
        }
    }

    /// Parse a wire query name.
    pub fn from_wire(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(QueryKind::Ping),
            b"find_node" => Some(QueryKind::FindNode),
            b"get_peers" => Some(QueryKind::GetPeers),
            _ => None,
        }
    }

    /// The argument key the search target travels under; `None` for
    /// pings, which carry no target.
    pub fn target_key(&self) -> Option<&'static [u8]> {
        match self {
            QueryKind::Ping => None,
            QueryKind::FindNode => Some(keys::TARGET),
            QueryKind::GetPeers => Some(keys::INFO_HASH),
        }
    }
}

/// One DHT message: a bencoded dictionary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    root: BTreeMap<Vec<u8>, Value>,
}

impl Message {
    /// An empty message dictionary.
    pub fn new() -> Self {
        Message {
            root: BTreeMap::new(),
        }
    }

    /// Decode a message from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the bytes are not a single bencoded
    /// dictionary.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bencode::decode(bytes)? {
            Value::Dict(root) => Ok(Message { root }),
            _ => Err(WireError::NotADictionary),
        }
    }

    /// Encode this message to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        Value::Dict(self.root.clone()).encode()
    }

    /// Get a top-level byte-string field.
    pub fn get_string(&self, key: &[u8]) -> Option<&[u8]> {
        self.root.get(key).and_then(Value::as_bytes)
    }

    /// Set a top-level byte-string field.
    pub fn put_string(&mut self, key: &[u8], value: &[u8]) {
        self.root.insert(key.to_vec(), Value::Bytes(value.to_vec()));
    }

    /// Get a top-level sub-dictionary.
    pub fn get_dict(&self, key: &[u8]) -> Option<&BTreeMap<Vec<u8>, Value>> {
        self.root.get(key).and_then(Value::as_dict)
    }

    /// Get a top-level sub-dictionary, creating it if absent.
    pub fn dict_mut(&mut self, key: &[u8]) -> &mut BTreeMap<Vec<u8>, Value> {
        let entry = self
            .root
            .entry(key.to_vec())
            .or_insert_with(|| Value::Dict(BTreeMap::new()));
        if entry.as_dict().is_none() {
            // A scalar under a dict key is malformed; replace it.
            *entry = Value::Dict(BTreeMap::new());
        }
        match entry {
            Value::Dict(dict) => dict,
            _ => unreachable!("entry was just set to a dict"),
        }
    }

    /// Get a byte-string field inside a sub-dictionary.
    pub fn get_nested(&self, dict: &[u8], key: &[u8]) -> Option<&[u8]> {
        self.get_dict(dict)?.get(key).and_then(Value::as_bytes)
    }

    /// Set a byte-string field inside a sub-dictionary, creating the
    /// dictionary if absent.
    pub fn put_nested(&mut self, dict: &[u8], key: &[u8], value: &[u8]) {
        self.dict_mut(dict)
            .insert(key.to_vec(), Value::Bytes(value.to_vec()));
    }

    /// The transaction id, if present.
    pub fn transaction_id(&self) -> Option<&[u8]> {
        self.get_string(keys::TRANSACTION_ID)
    }

    /// The message type tag (`q`, `r` or `e`), if present.
    pub fn message_type(&self) -> Option<&[u8]> {
        self.get_string(keys::MESSAGE_TYPE)
    }

    /// Whether this message is tagged as a reply.
    pub fn is_reply(&self) -> bool {
        self.message_type() == Some(keys::REPLY)
    }

    /// The query name, if present.
    pub fn query_name(&self) -> Option<&[u8]> {
        self.get_string(keys::QUERY)
    }
}
