//! Per-peer session state machine.
//!
//! A [`Session`] tracks one `NodeAddress` through the WHOAREYOU handshake and, once keys are
//! installed, encrypts and decrypts the message section of ordinary packets. Transitioning
//! into `Established` always replaces any prior key material.

use crate::{
    crypto::{self, CryptoProvider, KEY_LENGTH},
    error::{CryptoError, Discv5Error},
    node::NodeAddress,
    packet::{IdNonce, MessageNonce, Packet, MESSAGE_NONCE_LENGTH},
    Enr,
};
use enr::NodeId;
use secp256k1::SecretKey;
use std::time::Instant;
use zeroize::Zeroize;

/// Reasons a handshake packet fails to establish a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum HandshakeError {
    /// Neither the handshake nor the challenge supplied a record for the peer.
    #[error("no ENR known for the handshake peer")]
    UnknownEnr,
    /// The id-signature does not verify against the peer's static key.
    #[error("invalid id-signature")]
    InvalidSignature,
    /// Key agreement failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Directional AES-128-GCM session keys. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Keys {
    /// Key for outbound messages.
    pub(crate) encryption_key: [u8; KEY_LENGTH],
    /// Key for inbound messages.
    pub(crate) decryption_key: [u8; KEY_LENGTH],
}

impl Drop for Keys {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.decryption_key.zeroize();
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Keys")
    }
}

/// An outstanding WHOAREYOU we issued: the exact challenge bytes must be retained to reproduce
/// the handshake commitment, along with the freshest record we knew when challenging.
#[derive(Debug, Clone)]
pub(crate) struct Challenge {
    /// The full WHOAREYOU bytes: masking IV, static header and authdata.
    pub(crate) data: Vec<u8>,
    /// The record we knew for the peer when the challenge was sent, if any.
    pub(crate) remote_enr: Option<Enr>,
}

/// The session states.
#[derive(Debug)]
enum SessionState {
    /// We sent a random packet to provoke a WHOAREYOU; nothing is keyed yet.
    RandomSent,
    /// We answered an undecryptable packet with a WHOAREYOU and await the handshake.
    WhoAreYouSent { challenge: Challenge },
    /// We answered a WHOAREYOU with a handshake; keys are derived but unconfirmed until the
    /// peer first speaks under them.
    AwaitingSession { keys: Keys },
    /// Fully keyed in both directions.
    Established { keys: Keys },
    /// Established, but an inbound message failed to decrypt so a fresh WHOAREYOU is in
    /// flight. The old keys stay usable until the new handshake lands.
    EstablishedAwaitingResponse { keys: Keys, challenge: Challenge },
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::RandomSent => "RandomSent",
            SessionState::WhoAreYouSent { .. } => "WhoAreYouSent",
            SessionState::AwaitingSession { .. } => "AwaitingSession",
            SessionState::Established { .. } => "Established",
            SessionState::EstablishedAwaitingResponse { .. } => "EstablishedAwaitingResponse",
        }
    }
}

/// A session with a single [`NodeAddress`].
#[derive(Debug)]
pub(crate) struct Session {
    state: SessionState,
    /// Nonce counter for outbound messages under the current keys.
    counter: u32,
    /// Last send or successful receive, for idle expiry.
    last_activity: Instant,
}

// === impl Session ===

impl Session {
    /// A session for which we fired a random packet and expect to be challenged.
    pub(crate) fn new_random_sent() -> Self {
        Self::with_state(SessionState::RandomSent)
    }

    /// A session for which we issued the given challenge.
    pub(crate) fn new_whoareyou_sent(challenge: Challenge) -> Self {
        Self::with_state(SessionState::WhoAreYouSent { challenge })
    }

    fn with_state(state: SessionState) -> Self {
        Self { state, counter: 0, last_activity: Instant::now() }
    }

    /// The state name, for log output.
    pub(crate) fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Whether message keys are installed (confirmed or not).
    pub(crate) fn is_keyed(&self) -> bool {
        self.keys().is_some()
    }

    /// Whether the session reached `Established`.
    pub(crate) fn is_established(&self) -> bool {
        matches!(
            self.state,
            SessionState::Established { .. } | SessionState::EstablishedAwaitingResponse { .. }
        )
    }

    /// The challenge we are holding for this peer, if a WHOAREYOU is outstanding.
    pub(crate) fn challenge(&self) -> Option<&Challenge> {
        match &self.state {
            SessionState::WhoAreYouSent { challenge } |
            SessionState::EstablishedAwaitingResponse { challenge, .. } => Some(challenge),
            _ => None,
        }
    }

    fn keys(&self) -> Option<&Keys> {
        match &self.state {
            SessionState::AwaitingSession { keys } |
            SessionState::Established { keys } |
            SessionState::EstablishedAwaitingResponse { keys, .. } => Some(keys),
            _ => None,
        }
    }

    /// Whether the session has seen no traffic for `timeout`.
    pub(crate) fn is_expired(&self, timeout: std::time::Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }

    /// Degrades an established session after a decrypt failure: keys are kept, the given
    /// challenge rides along until the peer re-handshakes. No-op in other states.
    pub(crate) fn await_reestablishment(&mut self, challenge: Challenge) {
        let state = std::mem::replace(&mut self.state, SessionState::RandomSent);
        self.state = match state {
            SessionState::Established { keys } |
            SessionState::EstablishedAwaitingResponse { keys, .. } => {
                SessionState::EstablishedAwaitingResponse { keys, challenge }
            }
            other => other,
        };
    }

    /// Encrypts `payload` into an ordinary message packet.
    ///
    /// The nonce is a 32-bit send counter followed by 64 random bits, unique per direction for
    /// the lifetime of the keys.
    pub(crate) fn encrypt_message(
        &mut self,
        crypto: &dyn CryptoProvider,
        local_id: NodeId,
        payload: &[u8],
    ) -> Result<Packet, Discv5Error> {
        let Some(keys) = self.keys() else { return Err(Discv5Error::SessionNotEstablished) };
        let encryption_key = keys.encryption_key;

        self.counter = self.counter.wrapping_add(1);
        let mut nonce: MessageNonce = [0u8; MESSAGE_NONCE_LENGTH];
        nonce[..4].copy_from_slice(&self.counter.to_be_bytes());
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce[4..]);

        let mut packet = Packet::new_message(local_id, nonce, Vec::new());
        let aad = packet.authenticated_data();
        packet.message = crypto.aes_gcm_encrypt(&encryption_key, &nonce, &aad, payload)?;

        self.last_activity = Instant::now();
        Ok(packet)
    }

    /// Decrypts the message section of an inbound packet.
    ///
    /// The first successful decryption under unconfirmed keys confirms them and promotes the
    /// session to `Established`.
    pub(crate) fn decrypt_message(
        &mut self,
        crypto: &dyn CryptoProvider,
        nonce: &MessageNonce,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let Some(keys) = self.keys() else { return Err(CryptoError::DecryptionFailed) };
        let plaintext = crypto.aes_gcm_decrypt(&keys.decryption_key, nonce, aad, ciphertext)?;

        // The peer proved it holds the derived keys, confirm them.
        let state = std::mem::replace(&mut self.state, SessionState::RandomSent);
        self.state = match state {
            SessionState::AwaitingSession { keys } => SessionState::Established { keys },
            other => other,
        };
        self.last_activity = Instant::now();
        Ok(plaintext)
    }

    /// Answers a WHOAREYOU: derives keys via an ephemeral ECDH, signs the identity proof and
    /// wraps `payload` in a handshake packet. The returned session is in `AwaitingSession`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn encrypt_with_handshake(
        crypto: &dyn CryptoProvider,
        local_key: &SecretKey,
        local_id: NodeId,
        remote_id: NodeId,
        remote_pubkey: &secp256k1::PublicKey,
        challenge_data: &[u8],
        updated_enr: Option<Enr>,
        payload: &[u8],
    ) -> Result<(Packet, Session), Discv5Error> {
        let (ephem_secret, ephem_pubkey) = crypto.ephemeral_keypair();
        let secret = crypto.ecdh(&remote_pubkey.serialize(), &ephem_secret)?;

        // We answer the challenge, so we are the initiator of the key agreement.
        let (initiator_key, recipient_key) =
            crypto::derive_session_keys(crypto, &secret, &local_id, &remote_id, challenge_data)?;
        let encryption_key = initiator_key;
        let keys = Keys { encryption_key: initiator_key, decryption_key: recipient_key };

        let id_signature = crypto::generate_id_signature(
            crypto,
            local_key,
            challenge_data,
            &ephem_pubkey,
            &remote_id,
        )?;

        let mut session = Session::with_state(SessionState::AwaitingSession { keys });
        session.counter = session.counter.wrapping_add(1);
        let mut nonce: MessageNonce = [0u8; MESSAGE_NONCE_LENGTH];
        nonce[..4].copy_from_slice(&session.counter.to_be_bytes());
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce[4..]);

        let mut packet = Packet::new_handshake(
            local_id,
            nonce,
            id_signature,
            ephem_pubkey.to_vec(),
            updated_enr,
            Vec::new(),
        );
        let aad = packet.authenticated_data();
        packet.message = crypto.aes_gcm_encrypt(&encryption_key, &nonce, &aad, payload)?;

        Ok((packet, session))
    }

    /// Establishes a session from an inbound handshake answering a challenge we issued.
    ///
    /// Verifies the id-signature against the freshest record available (the one carried by
    /// the handshake or the one we held at challenge time) and derives the mirrored keys.
    /// Returns the established session and that record.
    pub(crate) fn establish_from_challenge(
        crypto: &dyn CryptoProvider,
        local_key: &SecretKey,
        local_id: NodeId,
        node_address: &NodeAddress,
        challenge: Challenge,
        id_signature: &[u8],
        ephem_pubkey: &[u8],
        enr_record: Option<Enr>,
    ) -> Result<(Session, Enr), HandshakeError> {
        let Challenge { data: challenge_data, remote_enr } = challenge;

        let enr = match (enr_record, remote_enr) {
            (Some(new), Some(known)) => {
                if new.seq() > known.seq() {
                    new
                } else {
                    known
                }
            }
            (Some(new), None) => new,
            (None, Some(known)) => known,
            (None, None) => return Err(HandshakeError::UnknownEnr),
        };

        if enr.node_id() != node_address.node_id {
            return Err(HandshakeError::UnknownEnr)
        }

        if !crypto::verify_id_signature(
            crypto,
            id_signature,
            &enr.public_key(),
            &challenge_data,
            ephem_pubkey,
            &local_id,
        ) {
            return Err(HandshakeError::InvalidSignature);
        }

        let secret = crypto.ecdh(ephem_pubkey, local_key)?;
        // The peer answered our challenge, so it is the initiator.
        let (initiator_key, recipient_key) = crypto::derive_session_keys(
            crypto,
            &secret,
            &node_address.node_id,
            &local_id,
            &challenge_data,
        )?;
        let keys = Keys { encryption_key: recipient_key, decryption_key: initiator_key };

        Ok((Session::with_state(SessionState::Established { keys }), enr))
    }
}

/// Builds the WHOAREYOU packet and the challenge record for it.
pub(crate) fn new_challenge(
    request_nonce: MessageNonce,
    remote_enr: Option<Enr>,
) -> (Packet, Challenge) {
    let id_nonce: IdNonce = rand::random();
    let enr_seq = remote_enr.as_ref().map_or(0, |enr| enr.seq());
    let packet = Packet::new_whoareyou(request_nonce, id_nonce, enr_seq);
    let challenge = Challenge { data: packet.authenticated_data(), remote_enr };
    (packet, challenge)
}
