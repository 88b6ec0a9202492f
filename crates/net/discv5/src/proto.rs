//! The RLP message payloads exchanged inside encrypted packets.
//!
//! A message is a 1-byte type tag followed by an RLP list whose first element is the request
//! id: PING `[id, enr_seq]`, PONG `[id, enr_seq, ip, port]`, FINDNODE `[id, [distances]]`,
//! NODES `[id, total, [enrs]]`, TALKREQ `[id, protocol, request]`, TALKRESP `[id, response]`.

use crate::Enr;
use alloy_rlp::{Decodable, Encodable, Error as RlpError, RlpDecodable, RlpEncodable};
use bytes::{BufMut, Bytes};
use std::{
    fmt,
    net::{IpAddr, Ipv6Addr, SocketAddr},
};

/// An opaque request identifier, at most 8 bytes, echoed verbatim by responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub Vec<u8>);

// === impl RequestId ===

impl RequestId {
    /// Generates a fresh random 8-byte id.
    pub fn random() -> Self {
        let id: [u8; 8] = rand::random();
        Self(id.to_vec())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl Encodable for RequestId {
    fn encode(&self, out: &mut dyn BufMut) {
        self.0.as_slice().encode(out)
    }
    fn length(&self) -> usize {
        self.0.as_slice().length()
    }
}

impl Decodable for RequestId {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let bytes = Bytes::decode(buf)?;
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(RlpError::Custom("request id must be 1..=8 bytes"))
        }
        Ok(Self(bytes.to_vec()))
    }
}

/// An IP address read from a PONG: a 4- or 16-byte RLP string.
///
/// Decode-only; the encode side writes the octet slice straight into the wire struct. An
/// IPv4-mapped IPv6 address collapses to the IPv4 it carries, so both spellings of the same
/// endpoint compare equal.
struct IpOctets(IpAddr);

impl Decodable for IpOctets {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        let octets = Bytes::decode(buf)?;
        let ip = match octets.len() {
            4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&octets);
                IpAddr::from(raw)
            }
            16 => {
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&octets);
                match Ipv6Addr::from(raw).to_ipv4_mapped() {
                    Some(mapped) => IpAddr::V4(mapped),
                    None => IpAddr::from(raw),
                }
            }
            _ => return Err(RlpError::UnexpectedLength),
        };
        Ok(Self(ip))
    }
}

/// Liveness probe carrying the sender's current ENR sequence number.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Ping {
    /// Request id.
    pub id: RequestId,
    /// The sender's current ENR sequence number.
    pub enr_seq: u64,
}

/// Response to [`Ping`], reporting the observed external endpoint of the asker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// Request id this answers.
    pub id: RequestId,
    /// The responder's current ENR sequence number.
    pub enr_seq: u64,
    /// The IP the request was observed from.
    pub recipient_ip: IpAddr,
    /// The UDP port the request was observed from.
    pub recipient_port: u16,
}

impl Pong {
    /// The observed external socket of the pinged node.
    pub fn recipient_socket(&self) -> SocketAddr {
        SocketAddr::new(self.recipient_ip, self.recipient_port)
    }
}

impl Encodable for Pong {
    fn encode(&self, out: &mut dyn BufMut) {
        #[derive(RlpEncodable)]
        struct Wire<'a> {
            id: &'a RequestId,
            enr_seq: u64,
            ip: &'a [u8],
            port: u16,
        }
        let mut octets = [0u8; 16];
        let ip: &[u8] = match self.recipient_ip {
            IpAddr::V4(addr) => {
                octets[..4].copy_from_slice(&addr.octets());
                &octets[..4]
            }
            IpAddr::V6(addr) => {
                octets.copy_from_slice(&addr.octets());
                &octets
            }
        };
        Wire { id: &self.id, enr_seq: self.enr_seq, ip, port: self.recipient_port }.encode(out)
    }
}

impl Decodable for Pong {
    fn decode(buf: &mut &[u8]) -> Result<Self, RlpError> {
        #[derive(RlpDecodable)]
        struct Wire {
            id: RequestId,
            enr_seq: u64,
            ip: IpOctets,
            port: u16,
        }
        let Wire { id, enr_seq, ip: IpOctets(recipient_ip), port } = Wire::decode(buf)?;
        Ok(Self { id, enr_seq, recipient_ip, recipient_port: port })
    }
}

/// Queries the peers a node knows at the given `log2` distances.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct FindNode {
    /// Request id.
    pub id: RequestId,
    /// Requested `log2` distances; `[0]` asks for the responder's own record.
    pub distances: Vec<u64>,
}

/// One page of a [`FindNode`] answer; `total` pages make up the full response.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Nodes {
    /// Request id this answers.
    pub id: RequestId,
    /// Total number of NODES packets in this response.
    pub total: u64,
    /// The records of this page.
    pub nodes: Vec<Enr>,
}

/// An opaque application request routed over the discovery session.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TalkRequest {
    /// Request id.
    pub id: RequestId,
    /// Application protocol identifier.
    pub protocol: Bytes,
    /// Application payload.
    pub request: Bytes,
}

/// Response to a [`TalkRequest`].
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TalkResponse {
    /// Request id this answers.
    pub id: RequestId,
    /// Application payload; empty when the peer has no handler for the protocol.
    pub response: Bytes,
}

/// A decoded discv5 message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// PING (0x01)
    Ping(Ping),
    /// PONG (0x02)
    Pong(Pong),
    /// FINDNODE (0x03)
    FindNode(FindNode),
    /// NODES (0x04)
    Nodes(Nodes),
    /// TALKREQ (0x05)
    TalkRequest(TalkRequest),
    /// TALKRESP (0x06)
    TalkResponse(TalkResponse),
}

// === impl Message ===

impl Message {
    /// The wire type tag.
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Ping(_) => 1,
            Message::Pong(_) => 2,
            Message::FindNode(_) => 3,
            Message::Nodes(_) => 4,
            Message::TalkRequest(_) => 5,
            Message::TalkResponse(_) => 6,
        }
    }

    /// The request id carried by every message kind.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Message::Ping(m) => &m.id,
            Message::Pong(m) => &m.id,
            Message::FindNode(m) => &m.id,
            Message::Nodes(m) => &m.id,
            Message::TalkRequest(m) => &m.id,
            Message::TalkResponse(m) => &m.id,
        }
    }

    /// Whether this message answers requests, as opposed to initiating them.
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Pong(_) | Message::Nodes(_) | Message::TalkResponse(_))
    }

    /// Serializes the message: type tag followed by the RLP list.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(self.msg_type());
        match self {
            Message::Ping(m) => m.encode(&mut buf),
            Message::Pong(m) => m.encode(&mut buf),
            Message::FindNode(m) => m.encode(&mut buf),
            Message::Nodes(m) => m.encode(&mut buf),
            Message::TalkRequest(m) => m.encode(&mut buf),
            Message::TalkResponse(m) => m.encode(&mut buf),
        }
        buf
    }

    /// Parses a message from its serialized form.
    pub fn decode(data: &[u8]) -> Result<Self, RlpError> {
        if data.is_empty() {
            return Err(RlpError::InputTooShort)
        }
        let buf = &mut &data[1..];
        let message = match data[0] {
            1 => Message::Ping(Ping::decode(buf)?),
            2 => Message::Pong(Pong::decode(buf)?),
            3 => Message::FindNode(FindNode::decode(buf)?),
            4 => Message::Nodes(Nodes::decode(buf)?),
            5 => Message::TalkRequest(TalkRequest::decode(buf)?),
            6 => Message::TalkResponse(TalkResponse::decode(buf)?),
            _ => return Err(RlpError::Custom("unknown message type")),
        };
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Ping(m) => write!(f, "PING(id: {}, enr_seq: {})", m.id, m.enr_seq),
            Message::Pong(m) => {
                write!(f, "PONG(id: {}, enr_seq: {}, observed: {})", m.id, m.enr_seq, m.recipient_socket())
            }
            Message::FindNode(m) => write!(f, "FINDNODE(id: {}, distances: {:?})", m.id, m.distances),
            Message::Nodes(m) => {
                write!(f, "NODES(id: {}, total: {}, nodes: {})", m.id, m.total, m.nodes.len())
            }
            Message::TalkRequest(m) => write!(f, "TALKREQ(id: {}, len: {})", m.id, m.request.len()),
            Message::TalkResponse(m) => write!(f, "TALKRESP(id: {}, len: {})", m.id, m.response.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id(byte: u8) -> RequestId {
        RequestId(vec![byte])
    }

    #[test]
    fn test_ping_known_bytes() {
        let msg = Message::Ping(Ping { id: id(1), enr_seq: 1 });
        let encoded = msg.encode();
        assert_eq!(hex::encode(&encoded), "01c20101");
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_pong_known_bytes() {
        let msg = Message::Pong(Pong {
            id: id(1),
            enr_seq: 1,
            recipient_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            recipient_port: 5500,
        });
        let encoded = msg.encode();
        assert_eq!(hex::encode(&encoded), "02ca0101847f00000182157c");
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_findnode_known_bytes() {
        let msg = Message::FindNode(FindNode { id: id(1), distances: vec![256] });
        let encoded = msg.encode();
        assert_eq!(hex::encode(&encoded), "03c501c3820100");
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_talk_round_trip() {
        let req = Message::TalkRequest(TalkRequest {
            id: RequestId::random(),
            protocol: Bytes::from_static(b"echo"),
            request: Bytes::from(vec![0, 1, 2, 3]),
        });
        assert_eq!(Message::decode(&req.encode()).unwrap(), req);

        let resp = Message::TalkResponse(TalkResponse {
            id: RequestId::random(),
            response: Bytes::from(vec![4, 5, 6, 7]),
        });
        assert_eq!(Message::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn test_nodes_with_enr_round_trip() {
        let key = secp256k1::SecretKey::new(&mut rand::thread_rng());
        let enr = Enr::builder()
            .ip4(Ipv4Addr::LOCALHOST)
            .udp4(30303)
            .build(&key)
            .unwrap();

        let msg = Message::Nodes(Nodes { id: id(9), total: 1, nodes: vec![enr] });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_pong_ipv6_round_trip() {
        let msg = Message::Pong(Pong {
            id: RequestId::random(),
            enr_seq: 42,
            recipient_ip: "2001:db8::1".parse().unwrap(),
            recipient_port: 9000,
        });
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_rejects_oversized_request_id() {
        // A PING whose id is a 9-byte string: 0x01 || list(0x89 <9 bytes>, 0x01).
        let mut buf = vec![0x01, 0xcb, 0x89];
        buf.extend_from_slice(&[0x11; 9]);
        buf.push(0x01);
        assert!(Message::decode(&buf).is_err());
    }
}
