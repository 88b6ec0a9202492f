//! Node identity types: [`NodeAddress`], [`NodeContact`] and XOR distance math.

use crate::{error::Discv5Error, Enr};
use enr::NodeId;
use std::{
    cmp::Ordering,
    fmt,
    net::SocketAddr,
};

/// Number of buckets in the routing table, one per possible `log2` distance.
pub const NUM_BUCKETS: usize = 256;

/// A node identifier together with the UDP socket it was observed on.
///
/// Sessions are keyed on this pair: the [`NodeId`] is authoritative for identity while the
/// socket address is what makes the peer routable. A peer that changes address gets a fresh
/// session.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    /// The destination socket address.
    pub socket_addr: SocketAddr,
    /// The destination node id.
    pub node_id: NodeId,
}

impl NodeAddress {
    /// Creates a new `NodeAddress`.
    pub fn new(socket_addr: SocketAddr, node_id: NodeId) -> Self {
        Self { socket_addr, node_id }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", fmt_node_id(&self.node_id), self.socket_addr)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({self})")
    }
}

/// A dialable peer: a verified ENR resolved to a concrete UDP socket.
///
/// Only records advertising a UDP endpoint can be contacted, so the resolution happens once at
/// construction instead of on every send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContact {
    enr: Enr,
    socket_addr: SocketAddr,
}

// === impl NodeContact ===

impl NodeContact {
    /// Resolves the ENR to a contactable UDP socket, preferring IPv4.
    pub fn try_from_enr(enr: Enr) -> Result<Self, Discv5Error> {
        let socket_addr = enr
            .udp4_socket()
            .map(SocketAddr::V4)
            .or_else(|| enr.udp6_socket().map(SocketAddr::V6))
            .ok_or(Discv5Error::UnroutableEnr)?;
        Ok(Self { enr, socket_addr })
    }

    /// The node id of the peer.
    pub fn node_id(&self) -> NodeId {
        self.enr.node_id()
    }

    /// The session key for this peer.
    pub fn node_address(&self) -> NodeAddress {
        NodeAddress::new(self.socket_addr, self.enr.node_id())
    }

    /// The record this contact was derived from.
    pub fn enr(&self) -> &Enr {
        &self.enr
    }

    /// The compressed public key of the peer, as advertised in the record.
    pub fn public_key(&self) -> secp256k1::PublicKey {
        self.enr.public_key()
    }
}

impl fmt::Display for NodeContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", fmt_node_id(&self.enr.node_id()), self.socket_addr)
    }
}

/// The XOR metric between two node ids, ordered as a 256-bit big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 32]);

impl Distance {
    /// The zero distance, i.e. identical node ids.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Returns `log2(distance)` rounded up, the routing-table bucket number in `[1, 256]`.
    ///
    /// Returns `None` for the zero distance, which has no bucket.
    pub fn log2(&self) -> Option<u64> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return Some(256 - i as u64 * 8 - byte.leading_zeros() as u64)
            }
        }
        None
    }

    /// The index of the bucket this distance falls in: `log2 - 1`, in `[0, 255]`.
    pub fn bucket_index(&self) -> Option<usize> {
        self.log2().map(|log2| log2 as usize - 1)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.log2() {
            Some(log2) => write!(f, "Distance(2^{log2})"),
            None => write!(f, "Distance(0)"),
        }
    }
}

/// Computes the XOR distance between two node ids.
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    let (a, b) = (a.raw(), b.raw());
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    Distance(out)
}

/// Compares two node ids by their distance to `target`.
pub fn cmp_by_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance(target, a).cmp(&distance(target, b))
}

/// Short hex rendering of a node id for log output.
pub(crate) fn fmt_node_id(id: &NodeId) -> String {
    let raw = id.raw();
    format!("0x{}..{}", hex::encode(&raw[..2]), hex::encode(&raw[30..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: [u8; 32]) -> NodeId {
        NodeId::new(&raw)
    }

    #[test]
    fn test_zero_distance_has_no_bucket() {
        let a = NodeId::random();
        assert_eq!(distance(&a, &a), Distance::ZERO);
        assert_eq!(distance(&a, &a).bucket_index(), None);
    }

    #[test]
    fn test_log2_distance() {
        let zero = id([0u8; 32]);

        let mut one = [0u8; 32];
        one[31] = 1;
        assert_eq!(distance(&zero, &id(one)).log2(), Some(1));

        let mut two_fifty_five = [0u8; 32];
        two_fifty_five[0] = 0x40;
        assert_eq!(distance(&zero, &id(two_fifty_five)).log2(), Some(255));

        let max = id([0xff; 32]);
        assert_eq!(distance(&zero, &max).log2(), Some(256));
        assert_eq!(distance(&zero, &max).bucket_index(), Some(255));
    }

    #[test]
    fn test_bucket_index_stable_under_symmetry() {
        for _ in 0..100 {
            let a = NodeId::random();
            let b = NodeId::random();
            assert_eq!(distance(&a, &b).bucket_index(), distance(&b, &a).bucket_index());
        }
    }

    #[test]
    fn test_distance_ordering_is_big_endian() {
        let zero = id([0u8; 32]);
        let mut small = [0u8; 32];
        small[31] = 0xff;
        let mut big = [0u8; 32];
        big[0] = 1;
        assert!(distance(&zero, &id(small)) < distance(&zero, &id(big)));
    }
}
