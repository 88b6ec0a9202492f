//! Discovery v5.1 wire packets.
//!
//! Every packet is `masking-iv || masked(static-header || authdata) || message`. The static
//! header and authdata are masked with AES-128-CTR under the first 16 bytes of the recipient's
//! node id, which hides the packet type from everyone but the addressee. The message section,
//! when present, is AES-128-GCM ciphertext and is not masked.

use crate::{
    crypto::{CryptoProvider, PUBKEY_LENGTH, SIGNATURE_LENGTH},
    error::DecoderError,
    Enr,
};
use alloy_rlp::{Decodable, Encodable};
use enr::NodeId;
use std::fmt;

/// ASCII protocol id carried in every static header.
pub const PROTOCOL_ID: &[u8; 6] = b"discv5";
/// Wire protocol version.
pub const PROTOCOL_VERSION: u16 = 0x0001;
/// Length of the masking IV prefix.
pub const MASKING_IV_LENGTH: usize = 16;
/// Length of the fixed portion of the header: protocol id, version, flag, nonce, authdata-size.
pub const STATIC_HEADER_LENGTH: usize = 23;
/// Length of the per-message GCM nonce.
pub const MESSAGE_NONCE_LENGTH: usize = 12;
/// Length of the WHOAREYOU id-nonce.
pub const ID_NONCE_LENGTH: usize = 16;
/// Authdata length of a WHOAREYOU packet: id-nonce plus ENR sequence number.
const WHOAREYOU_AUTHDATA_SIZE: usize = ID_NONCE_LENGTH + 8;
/// Authdata length of an ordinary message packet: the source node id.
const MESSAGE_AUTHDATA_SIZE: usize = 32;
/// Fixed prefix of a handshake authdata: source id, sig-size and eph-key-size octets.
const HANDSHAKE_AUTHDATA_MIN_SIZE: usize = 34;
/// Smallest well-formed packet: IV, static header and WHOAREYOU authdata.
pub const MIN_PACKET_SIZE: usize = MASKING_IV_LENGTH + STATIC_HEADER_LENGTH + WHOAREYOU_AUTHDATA_SIZE;
/// Largest datagram the protocol will emit or accept.
pub const MAX_PACKET_SIZE: usize = 1280;
/// Size of the random payload carried by a session-initiating random packet.
const RANDOM_MESSAGE_SIZE: usize = 44;

/// The nonce attached to every encrypted message.
pub type MessageNonce = [u8; MESSAGE_NONCE_LENGTH];
/// The random nonce a WHOAREYOU challenges the peer to sign over.
pub type IdNonce = [u8; ID_NONCE_LENGTH];
/// The random masking IV prefixed to every packet.
pub type MaskingIv = [u8; MASKING_IV_LENGTH];

/// The three packet kinds, discriminated by the header flag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    /// An ordinary message packet; authdata is the source node id.
    Message {
        /// The sender.
        src_id: NodeId,
    },
    /// A handshake challenge; carries no message body.
    WhoAreYou {
        /// Random nonce the handshake id-signature must commit to.
        id_nonce: IdNonce,
        /// Highest ENR sequence number the challenger knows for us, 0 if unknown.
        enr_seq: u64,
    },
    /// A handshake response carrying the identity proof and key-agreement material.
    Handshake {
        /// The sender.
        src_id: NodeId,
        /// Compact ECDSA signature over the identity-proof digest.
        id_signature: Vec<u8>,
        /// Compressed ephemeral public key.
        ephem_pubkey: Vec<u8>,
        /// Fresh record, included when the challenger's known sequence number was stale.
        enr_record: Option<Enr>,
    },
}

// === impl PacketKind ===

impl PacketKind {
    /// The header flag byte for this kind.
    pub fn flag(&self) -> u8 {
        match self {
            PacketKind::Message { .. } => 0,
            PacketKind::WhoAreYou { .. } => 1,
            PacketKind::Handshake { .. } => 2,
        }
    }

    /// Encodes the variable authdata section.
    fn encode_authdata(&self) -> Vec<u8> {
        match self {
            PacketKind::Message { src_id } => src_id.raw().to_vec(),
            PacketKind::WhoAreYou { id_nonce, enr_seq } => {
                let mut authdata = Vec::with_capacity(WHOAREYOU_AUTHDATA_SIZE);
                authdata.extend_from_slice(id_nonce);
                authdata.extend_from_slice(&enr_seq.to_be_bytes());
                authdata
            }
            PacketKind::Handshake { src_id, id_signature, ephem_pubkey, enr_record } => {
                let mut authdata = Vec::with_capacity(
                    HANDSHAKE_AUTHDATA_MIN_SIZE + id_signature.len() + ephem_pubkey.len(),
                );
                authdata.extend_from_slice(&src_id.raw());
                authdata.push(id_signature.len() as u8);
                authdata.push(ephem_pubkey.len() as u8);
                authdata.extend_from_slice(id_signature);
                authdata.extend_from_slice(ephem_pubkey);
                if let Some(enr) = enr_record {
                    enr.encode(&mut authdata);
                }
                authdata
            }
        }
    }

    /// Parses the authdata section for the given flag byte.
    fn decode_authdata(flag: u8, authdata: &[u8]) -> Result<Self, DecoderError> {
        match flag {
            0 => {
                if authdata.len() != MESSAGE_AUTHDATA_SIZE {
                    return Err(DecoderError::InvalidAuthdata)
                }
                let mut raw = [0u8; 32];
                raw.copy_from_slice(authdata);
                Ok(PacketKind::Message { src_id: NodeId::new(&raw) })
            }
            1 => {
                if authdata.len() != WHOAREYOU_AUTHDATA_SIZE {
                    return Err(DecoderError::InvalidAuthdata)
                }
                let mut id_nonce = [0u8; ID_NONCE_LENGTH];
                id_nonce.copy_from_slice(&authdata[..ID_NONCE_LENGTH]);
                let mut seq = [0u8; 8];
                seq.copy_from_slice(&authdata[ID_NONCE_LENGTH..]);
                Ok(PacketKind::WhoAreYou { id_nonce, enr_seq: u64::from_be_bytes(seq) })
            }
            2 => {
                if authdata.len() < HANDSHAKE_AUTHDATA_MIN_SIZE {
                    return Err(DecoderError::InvalidAuthdata)
                }
                let mut raw = [0u8; 32];
                raw.copy_from_slice(&authdata[..32]);
                let sig_size = authdata[32] as usize;
                let eph_size = authdata[33] as usize;
                // Only the v4 identity scheme is spoken: compact signatures and compressed
                // secp256k1 ephemeral keys.
                if sig_size != SIGNATURE_LENGTH || eph_size != PUBKEY_LENGTH {
                    return Err(DecoderError::InvalidAuthdata)
                }
                let keys_end = HANDSHAKE_AUTHDATA_MIN_SIZE + sig_size + eph_size;
                if authdata.len() < keys_end {
                    return Err(DecoderError::InvalidAuthdata)
                }
                let id_signature = authdata[34..34 + sig_size].to_vec();
                let ephem_pubkey = authdata[34 + sig_size..keys_end].to_vec();
                let enr_record = if authdata.len() > keys_end {
                    let mut enr_bytes = &authdata[keys_end..];
                    let enr =
                        Enr::decode(&mut enr_bytes).map_err(|_| DecoderError::InvalidAuthdata)?;
                    if !enr_bytes.is_empty() {
                        return Err(DecoderError::InvalidAuthdata)
                    }
                    Some(enr)
                } else {
                    None
                };
                Ok(PacketKind::Handshake {
                    src_id: NodeId::new(&raw),
                    id_signature,
                    ephem_pubkey,
                    enr_record,
                })
            }
            unknown => Err(DecoderError::UnknownPacketKind(unknown)),
        }
    }
}

/// The unmasked packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Nonce of the message section; for WHOAREYOU this echoes the undecryptable packet.
    pub message_nonce: MessageNonce,
    /// The packet kind with its parsed authdata.
    pub kind: PacketKind,
}

/// A decoded discv5 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The masking IV this packet was, or will be, masked with.
    pub iv: MaskingIv,
    /// The unmasked header.
    pub header: PacketHeader,
    /// GCM ciphertext; empty for WHOAREYOU.
    pub message: Vec<u8>,
}

// === impl Packet ===

impl Packet {
    /// Creates an ordinary message packet.
    pub fn new_message(src_id: NodeId, message_nonce: MessageNonce, ciphertext: Vec<u8>) -> Self {
        Self {
            iv: rand::random(),
            header: PacketHeader { message_nonce, kind: PacketKind::Message { src_id } },
            message: ciphertext,
        }
    }

    /// Creates a session-initiating packet: ordinary framing around unreadable random bytes.
    pub fn new_random(src_id: NodeId) -> Self {
        let mut message = vec![0u8; RANDOM_MESSAGE_SIZE];
        rand::Rng::fill(&mut rand::thread_rng(), message.as_mut_slice());
        Self::new_message(src_id, rand::random(), message)
    }

    /// Creates a WHOAREYOU challenge referencing the nonce of the packet that prompted it.
    pub fn new_whoareyou(request_nonce: MessageNonce, id_nonce: IdNonce, enr_seq: u64) -> Self {
        Self {
            iv: rand::random(),
            header: PacketHeader {
                message_nonce: request_nonce,
                kind: PacketKind::WhoAreYou { id_nonce, enr_seq },
            },
            message: Vec::new(),
        }
    }

    /// Creates a handshake packet.
    pub fn new_handshake(
        src_id: NodeId,
        message_nonce: MessageNonce,
        id_signature: Vec<u8>,
        ephem_pubkey: Vec<u8>,
        enr_record: Option<Enr>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            iv: rand::random(),
            header: PacketHeader {
                message_nonce,
                kind: PacketKind::Handshake { src_id, id_signature, ephem_pubkey, enr_record },
            },
            message: ciphertext,
        }
    }

    /// The nonce of the message section.
    pub fn message_nonce(&self) -> &MessageNonce {
        &self.header.message_nonce
    }

    /// The bytes every GCM operation and the handshake signature authenticate:
    /// `masking-iv || static-header || authdata`, all unmasked.
    ///
    /// For a WHOAREYOU packet this is exactly the challenge data both sides feed into key
    /// derivation, so it must be byte-identical on sender and receiver.
    pub fn authenticated_data(&self) -> Vec<u8> {
        let authdata = self.header.kind.encode_authdata();
        let mut out =
            Vec::with_capacity(MASKING_IV_LENGTH + STATIC_HEADER_LENGTH + authdata.len());
        out.extend_from_slice(&self.iv);
        self.push_static_header(&mut out, authdata.len());
        out.extend_from_slice(&authdata);
        out
    }

    fn push_static_header(&self, out: &mut Vec<u8>, authdata_size: usize) {
        out.extend_from_slice(PROTOCOL_ID);
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.push(self.header.kind.flag());
        out.extend_from_slice(&self.header.message_nonce);
        out.extend_from_slice(&(authdata_size as u16).to_be_bytes());
    }

    /// Encodes and masks the packet for the given recipient.
    pub fn encode(&self, crypto: &dyn CryptoProvider, dst_id: &NodeId) -> Vec<u8> {
        let authdata = self.header.kind.encode_authdata();
        let masked_len = STATIC_HEADER_LENGTH + authdata.len();
        let mut out = Vec::with_capacity(MASKING_IV_LENGTH + masked_len + self.message.len());

        out.extend_from_slice(&self.iv);
        self.push_static_header(&mut out, authdata.len());
        out.extend_from_slice(&authdata);
        crypto.aes_ctr_apply(&masking_key(dst_id), &self.iv, &mut out[MASKING_IV_LENGTH..]);
        out.extend_from_slice(&self.message);
        out
    }

    /// Unmasks and decodes a datagram addressed to `local_id`.
    pub fn decode(
        crypto: &dyn CryptoProvider,
        local_id: &NodeId,
        data: &[u8],
    ) -> Result<Self, DecoderError> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(DecoderError::TooSmall)
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(DecoderError::TooLarge)
        }

        let mut iv = [0u8; MASKING_IV_LENGTH];
        iv.copy_from_slice(&data[..MASKING_IV_LENGTH]);

        // The masked region ends at an offset we only learn from the header itself, so unmask a
        // copy of the whole remainder and read the header and authdata out of it. Message bytes
        // are taken from the original datagram.
        let mut unmasked = data[MASKING_IV_LENGTH..].to_vec();
        crypto.aes_ctr_apply(&masking_key(local_id), &iv, &mut unmasked);

        if &unmasked[..6] != PROTOCOL_ID {
            return Err(DecoderError::WrongProtocol)
        }
        let version = u16::from_be_bytes([unmasked[6], unmasked[7]]);
        if version != PROTOCOL_VERSION {
            return Err(DecoderError::UnsupportedVersion(version))
        }
        let flag = unmasked[8];
        let mut message_nonce = [0u8; MESSAGE_NONCE_LENGTH];
        message_nonce.copy_from_slice(&unmasked[9..9 + MESSAGE_NONCE_LENGTH]);
        let authdata_size =
            u16::from_be_bytes([unmasked[STATIC_HEADER_LENGTH - 2], unmasked[STATIC_HEADER_LENGTH - 1]])
                as usize;

        if unmasked.len() < STATIC_HEADER_LENGTH + authdata_size {
            return Err(DecoderError::InvalidAuthdata)
        }
        let authdata = &unmasked[STATIC_HEADER_LENGTH..STATIC_HEADER_LENGTH + authdata_size];
        let kind = PacketKind::decode_authdata(flag, authdata)?;

        let message = data[MASKING_IV_LENGTH + STATIC_HEADER_LENGTH + authdata_size..].to_vec();
        match kind {
            PacketKind::WhoAreYou { .. } => {
                if !message.is_empty() {
                    return Err(DecoderError::InvalidAuthdata)
                }
            }
            // A GCM tag plus at least a message type byte.
            _ => {
                if message.len() < 17 {
                    return Err(DecoderError::InvalidAuthdata)
                }
            }
        }

        Ok(Self { iv, header: PacketHeader { message_nonce, kind }, message })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.header.kind {
            PacketKind::Message { .. } => "Message",
            PacketKind::WhoAreYou { .. } => "WhoAreYou",
            PacketKind::Handshake { .. } => "Handshake",
        };
        write!(f, "{}(nonce: 0x{})", kind, hex::encode(self.header.message_nonce))
    }
}

/// The CTR key a recipient unmasks with: the first 16 bytes of its node id.
fn masking_key(id: &NodeId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&id.raw()[..16]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCrypto;

    fn round_trip(packet: Packet) {
        let crypto = DefaultCrypto;
        let dst_id = NodeId::random();
        let encoded = packet.encode(&crypto, &dst_id);
        let decoded = Packet::decode(&crypto, &dst_id, &encoded).unwrap();
        assert_eq!(packet, decoded);
        assert_eq!(packet.authenticated_data(), decoded.authenticated_data());
    }

    #[test]
    fn test_message_packet_round_trip() {
        round_trip(Packet::new_message(NodeId::random(), rand::random(), vec![0xaa; 32]));
    }

    #[test]
    fn test_random_packet_round_trip() {
        round_trip(Packet::new_random(NodeId::random()));
    }

    #[test]
    fn test_whoareyou_round_trip_is_exactly_min_size() {
        let crypto = DefaultCrypto;
        let dst_id = NodeId::random();
        let packet = Packet::new_whoareyou(rand::random(), rand::random(), 42);
        let encoded = packet.encode(&crypto, &dst_id);
        assert_eq!(encoded.len(), MIN_PACKET_SIZE);
        assert_eq!(Packet::decode(&crypto, &dst_id, &encoded).unwrap(), packet);
    }

    #[test]
    fn test_handshake_round_trip() {
        round_trip(Packet::new_handshake(
            NodeId::random(),
            rand::random(),
            vec![1u8; SIGNATURE_LENGTH],
            vec![2u8; PUBKEY_LENGTH],
            None,
            vec![0xbb; 64],
        ));
    }

    #[test]
    fn test_rejects_short_and_oversized_packets() {
        let crypto = DefaultCrypto;
        let id = NodeId::random();
        assert_eq!(
            Packet::decode(&crypto, &id, &[0u8; MIN_PACKET_SIZE - 1]),
            Err(DecoderError::TooSmall)
        );
        assert_eq!(
            Packet::decode(&crypto, &id, &vec![0u8; MAX_PACKET_SIZE + 1]),
            Err(DecoderError::TooLarge)
        );
    }

    #[test]
    fn test_rejects_wrong_protocol_and_version() {
        let crypto = DefaultCrypto;
        let dst_id = NodeId::random();
        let packet = Packet::new_random(NodeId::random());
        let encoded = packet.encode(&crypto, &dst_id);

        // Unmasking with the wrong node id produces garbage, which must never pass the
        // protocol-id check for a packet this size.
        let other = NodeId::random();
        assert!(matches!(
            Packet::decode(&crypto, &other, &encoded),
            Err(DecoderError::WrongProtocol) | Err(DecoderError::InvalidAuthdata) |
            Err(DecoderError::UnsupportedVersion(_)) | Err(DecoderError::UnknownPacketKind(_))
        ));
    }

    #[test]
    fn test_ordinary_packet_without_body_is_rejected() {
        let crypto = DefaultCrypto;
        let dst_id = NodeId::random();
        let packet = Packet::new_message(NodeId::random(), rand::random(), Vec::new());
        let encoded = packet.encode(&crypto, &dst_id);
        // 16 IV + 23 header + 32 authdata and no body: above the floor but not a valid message.
        assert_eq!(Packet::decode(&crypto, &dst_id, &encoded), Err(DecoderError::InvalidAuthdata));
    }

    #[test]
    fn test_whoareyou_challenge_data_matches_wire_bytes() {
        let crypto = DefaultCrypto;
        let dst_id = NodeId::random();
        let packet = Packet::new_whoareyou(rand::random(), rand::random(), 7);
        let encoded = packet.encode(&crypto, &dst_id);
        let decoded = Packet::decode(&crypto, &dst_id, &encoded).unwrap();

        let challenge_data = decoded.authenticated_data();
        // IV on the wire is in the clear, the rest of the commitment is the unmasked bytes.
        assert_eq!(&challenge_data[..MASKING_IV_LENGTH], &encoded[..MASKING_IV_LENGTH]);
        assert_eq!(challenge_data.len(), MIN_PACKET_SIZE);
        assert_eq!(challenge_data, packet.authenticated_data());
    }
}
