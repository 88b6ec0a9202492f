//! Error types for the discovery service.

use std::io;

/// Failure modes when decoding an inbound wire packet.
///
/// All of these cause the datagram to be dropped silently; responding to malformed input would
/// be an amplification vector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecoderError {
    /// The packet is below the 63-byte minimum.
    #[error("packet is below the minimum size")]
    TooSmall,
    /// The packet exceeds the 1280-byte maximum.
    #[error("packet exceeds the maximum size")]
    TooLarge,
    /// The unmasked header does not carry the `discv5` protocol id.
    #[error("unknown protocol id")]
    WrongProtocol,
    /// The header declares a protocol version other than 0x0001.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
    /// The authdata section is malformed or its declared size is inconsistent.
    #[error("invalid authdata")]
    InvalidAuthdata,
    /// The header flag byte is not one of the three known packet kinds.
    #[error("unknown packet kind: {0}")]
    UnknownPacketKind(u8),
}

/// Failure modes of a cryptographic primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// AEAD open failed: wrong key, nonce reuse or a forged tag.
    #[error("message decryption failed")]
    DecryptionFailed,
    /// AEAD seal failed.
    #[error("message encryption failed")]
    EncryptionFailed,
    /// A public key could not be parsed from its wire form.
    #[error("invalid public key")]
    InvalidPublicKey,
    /// A secret key was rejected by the backend.
    #[error("invalid secret key")]
    InvalidSecretKey,
    /// Key derivation produced no output.
    #[error("key derivation failed")]
    KeyDerivationFailed,
    /// A signature could not be produced.
    #[error("signing failed")]
    SigningFailed,
}

/// An error raised while driving a request to completion.
///
/// These surface to API callers; apart from a failed handshake they do not tear down the
/// session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The response did not arrive within the configured timeout and retries.
    #[error("request timed out")]
    Timeout,
    /// The service was shut down while the request was pending.
    #[error("service shut down")]
    Shutdown,
    /// The destination record does not advertise a UDP endpoint.
    #[error("destination ENR is not contactable")]
    UnroutableEnr,
    /// The request addressed the local node.
    #[error("request addressed to the local node")]
    SelfRequest,
    /// The message could not be encrypted for the destination.
    #[error("failed to encrypt message: {0}")]
    EncryptionFailed(CryptoError),
    /// The remote answered the handshake with invalid material.
    #[error("remote sent an invalid handshake")]
    InvalidHandshake,
    /// The remote supplied a record that fails verification against its observed identity.
    #[error("remote sent an invalid ENR")]
    InvalidRemoteEnr,
}

/// Top-level errors of the discovery service.
#[derive(Debug, thiserror::Error)]
pub enum Discv5Error {
    /// The record does not advertise a UDP endpoint.
    #[error("ENR does not advertise a UDP endpoint")]
    UnroutableEnr,
    /// The local record is not signed by the supplied key.
    #[error("local ENR public key does not match the local key")]
    EnrKeyMismatch,
    /// The local ENR could not be updated and re-signed.
    #[error("failed to update the local ENR: {0}")]
    EnrUpdateFailed(String),
    /// A crypto primitive failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// No session exists for the peer.
    #[error("no established session")]
    SessionNotEstablished,
    /// Binding or driving the UDP socket failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The background service is no longer running.
    #[error("service not running")]
    ServiceNotRunning,
}
