//! Node identifiers and compact addresses.
//!
//! Node ids and record keys share a flat 160-bit keyspace whose only
//! metric is XOR. Ranking throughout the router uses the 32-bit prefix
//! (first four bytes, network order); full ids are compared only for
//! equality. Two distinct peers may share a prefix, so prefix equality
//! must never be used to deduplicate.

use std::fmt;
use std::net::SocketAddrV4;

use crate::{Result, WireError};

/// Length of a node id in bytes.
pub const NODE_ID_LEN: usize = 20;

/// Length of a compact IPv4:port address in bytes.
pub const NODE_ADDRESS_LEN: usize = 6;

/// Length of one record in a compact `nodes` blob.
pub const NODE_RECORD_LEN: usize = NODE_ID_LEN + NODE_ADDRESS_LEN;

/// A 160-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Wrap a raw 20-byte id.
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Parse an id from a wire field, rejecting anything but 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| WireError::BadIdLength(bytes.len()))?;
        Ok(NodeId(arr))
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// The 32-bit ranking prefix: the first four bytes read in network
    /// order as an unsigned integer.
    pub fn prefix(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Prefix XOR distance to `other`.
    pub fn prefix_distance(&self, other: &NodeId) -> u32 {
        self.prefix() ^ other.prefix()
    }

    /// Full-width XOR distance to `other`. Byte-wise comparison of the
    /// result orders ids by keyspace distance.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A compact 6-byte IPv4:port network address. Opaque to the router,
/// which only copies it between messages and the node store.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAddress([u8; NODE_ADDRESS_LEN]);

impl NodeAddress {
    /// Wrap raw compact-address bytes.
    pub const fn new(bytes: [u8; NODE_ADDRESS_LEN]) -> Self {
        NodeAddress(bytes)
    }

    /// Parse an address from a wire field, rejecting anything but 6 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NODE_ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| WireError::BadAddressLength(bytes.len()))?;
        Ok(NodeAddress(arr))
    }

    /// The raw compact bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ADDRESS_LEN] {
        &self.0
    }

    /// Convert to a socket address.
    pub fn to_socket_addr(&self) -> SocketAddrV4 {
        let ip = std::net::Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3]);
        let port = u16::from_be_bytes([self.0[4], self.0[5]]);
        SocketAddrV4::new(ip, port)
    }
}

impl From<SocketAddrV4> for NodeAddress {
    fn from(addr: SocketAddrV4) -> Self {
        let mut bytes = [0u8; NODE_ADDRESS_LEN];
        bytes[..4].copy_from_slice(&addr.ip().octets());
        bytes[4..].copy_from_slice(&addr.port().to_be_bytes());
        NodeAddress(bytes)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.to_socket_addr())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Encode peers as a compact `nodes` blob: 26 bytes per record.
pub fn encode_nodes(peers: &[(NodeId, NodeAddress)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * NODE_RECORD_LEN);
    for (id, addr) in peers {
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(addr.as_bytes());
    }
    out
}

/// Decode a compact `nodes` blob.
///
/// # Errors
///
/// Returns [`WireError::BadNodesLength`] when the length is not a
/// multiple of 26. Callers treat that reply as a ping answer.
pub fn decode_nodes(blob: &[u8]) -> Result<Vec<(NodeId, NodeAddress)>> {
    if blob.len() % NODE_RECORD_LEN != 0 {
        return Err(WireError::BadNodesLength(blob.len()));
    }
    let mut out = Vec::with_capacity(blob.len() / NODE_RECORD_LEN);
    for record in blob.chunks_exact(NODE_RECORD_LEN) {
        let id = NodeId::from_bytes(&record[..NODE_ID_LEN])?;
        let addr = NodeAddress::from_bytes(&record[NODE_ID_LEN..])?;
        out.push((id, addr));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_prefix(prefix: u32) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[..4].copy_from_slice(&prefix.to_be_bytes());
        NodeId::new(bytes)
    }

    #[test]
    fn test_prefix_is_network_order() {
        let id = id_with_prefix(0xAABBCCDD);
        assert_eq!(id.prefix(), 0xAABBCCDD);
    }

    #[test]
    fn test_prefix_distance_is_xor() {
        let a = id_with_prefix(0xAAAAAAAA);
        let b = id_with_prefix(0x55555555);
        assert_eq!(a.prefix_distance(&b), 0xFFFFFFFF);
        assert_eq!(a.prefix_distance(&a), 0);
    }

    #[test]
    fn test_full_distance_orders_ids() {
        let target = NodeId::new([0u8; NODE_ID_LEN]);
        let near = id_with_prefix(0x00000001);
        let far = id_with_prefix(0x80000000);
        assert!(near.distance(&target) < far.distance(&target));
    }

    #[test]
    fn test_id_rejects_wrong_length() {
        assert!(NodeId::from_bytes(&[0u8; 19]).is_err());
        assert!(NodeId::from_bytes(&[0u8; 21]).is_err());
        assert!(NodeId::from_bytes(&[0u8; 20]).is_ok());
    }

    #[test]
    fn test_address_socket_roundtrip() {
        let sock: SocketAddrV4 = "192.0.2.7:6881".parse().expect("valid addr");
        let addr = NodeAddress::from(sock);
        assert_eq!(addr.to_socket_addr(), sock);
        assert_eq!(addr.as_bytes(), &[192, 0, 2, 7, 0x1A, 0xE1]);
    }

    #[test]
    fn test_nodes_blob_roundtrip() {
        let peers = vec![
            (id_with_prefix(1), NodeAddress::new([10, 0, 0, 1, 0, 80])),
            (id_with_prefix(2), NodeAddress::new([10, 0, 0, 2, 0, 81])),
        ];
        let blob = encode_nodes(&peers);
        assert_eq!(blob.len(), 52);
        let decoded = decode_nodes(&blob).expect("decode");
        assert_eq!(decoded, peers);
    }

    #[test]
    fn test_nodes_blob_rejects_partial_record() {
        let blob = vec![0u8; 27];
        assert!(matches!(
            decode_nodes(&blob),
            Err(WireError::BadNodesLength(27))
        ));
    }

    #[test]
    fn test_empty_nodes_blob() {
        assert!(decode_nodes(&[]).expect("decode").is_empty());
    }
}
