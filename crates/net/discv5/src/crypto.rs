//! Cryptographic primitives behind a capability trait.
//!
//! The protocol core never touches a crypto backend directly: everything goes through
//! [`CryptoProvider`], injected at construction. [`DefaultCrypto`] is the production
//! implementation; tests can substitute deterministic fakes.

use crate::error::CryptoError;
use aes_gcm::{
    aead::{Aead, Payload},
    Aes128Gcm, KeyInit,
};
use cipher::{KeyIvInit, StreamCipher};
use enr::NodeId;
use hkdf::Hkdf;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use sha2::{Digest, Sha256};

/// Length of an AES-128 session key.
pub const KEY_LENGTH: usize = 16;
/// Length of a compressed secp256k1 public key.
pub const PUBKEY_LENGTH: usize = 33;
/// Length of a compact ECDSA signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// Domain separator of the handshake identity proof.
const ID_SIGNATURE_TEXT: &[u8] = b"discovery v5 identity proof";
/// Domain separator of the session key agreement.
const KEY_AGREEMENT_TEXT: &[u8] = b"discovery v5 key agreement";

type MaskingCipher = ctr::Ctr128BE<aes::Aes128>;

/// The set of primitives the discovery core relies on.
///
/// HKDF-SHA256, SHA-256, AES-128-GCM, AES-128-CTR, secp256k1 ECDH and ECDSA. Implementations
/// must be deterministic for everything except [`CryptoProvider::ephemeral_keypair`].
pub trait CryptoProvider: Send + Sync + std::fmt::Debug {
    /// SHA-256 of `data`.
    fn sha256(&self, data: &[u8]) -> [u8; 32];

    /// HKDF-Extract with the given salt, returning the pseudorandom key.
    fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> [u8; 32];

    /// HKDF-Expand of a pseudorandom key into `okm.len()` bytes.
    fn hkdf_expand(&self, prk: &[u8; 32], info: &[u8], okm: &mut [u8]) -> Result<(), CryptoError>;

    /// In-place AES-128-CTR keystream application, used for header masking.
    fn aes_ctr_apply(&self, key: &[u8; KEY_LENGTH], iv: &[u8; 16], data: &mut [u8]);

    /// AES-128-GCM seal. The ciphertext is `plaintext.len() + 16` bytes.
    fn aes_gcm_encrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; 12],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// AES-128-GCM open.
    fn aes_gcm_decrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; 12],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Generates a fresh ephemeral keypair, the public half in compressed form.
    fn ephemeral_keypair(&self) -> (SecretKey, [u8; PUBKEY_LENGTH]);

    /// ECDH between a compressed remote public key and a local secret.
    ///
    /// The shared secret is the compressed 33-byte encoding of the shared curve point.
    fn ecdh(&self, remote_pubkey: &[u8], local_secret: &SecretKey) -> Result<Vec<u8>, CryptoError>;

    /// Signs a 32-byte digest, compact encoding.
    fn sign(&self, secret: &SecretKey, digest: &[u8; 32]) -> Result<Vec<u8>, CryptoError>;

    /// Verifies a compact signature over a 32-byte digest.
    fn verify(&self, pubkey: &PublicKey, digest: &[u8; 32], signature: &[u8]) -> bool;
}

/// Production [`CryptoProvider`] backed by `secp256k1` and the RustCrypto AES/HKDF stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCrypto;

impl CryptoProvider for DefaultCrypto {
    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> [u8; 32] {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
        prk.into()
    }

    fn hkdf_expand(&self, prk: &[u8; 32], info: &[u8], okm: &mut [u8]) -> Result<(), CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| CryptoError::KeyDerivationFailed)?;
        hk.expand(info, okm).map_err(|_| CryptoError::KeyDerivationFailed)
    }

    fn aes_ctr_apply(&self, key: &[u8; KEY_LENGTH], iv: &[u8; 16], data: &mut [u8]) {
        let mut cipher = MaskingCipher::new(key.into(), iv.into());
        cipher.apply_keystream(data);
    }

    fn aes_gcm_encrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; 12],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Aes128Gcm::new(key.into())
            .encrypt(nonce.into(), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn aes_gcm_decrypt(
        &self,
        key: &[u8; KEY_LENGTH],
        nonce: &[u8; 12],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Aes128Gcm::new(key.into())
            .decrypt(nonce.into(), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn ephemeral_keypair(&self) -> (SecretKey, [u8; PUBKEY_LENGTH]) {
        let secret = SecretKey::new(&mut rand::thread_rng());
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        (secret, public.serialize())
    }

    fn ecdh(&self, remote_pubkey: &[u8], local_secret: &SecretKey) -> Result<Vec<u8>, CryptoError> {
        let remote =
            PublicKey::from_slice(remote_pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
        // 64 bytes of affine coordinates, big endian x || y.
        let point = secp256k1::ecdh::shared_secret_point(&remote, local_secret);
        let mut secret = vec![0u8; PUBKEY_LENGTH];
        secret[0] = 0x02 | (point[63] & 1);
        secret[1..].copy_from_slice(&point[..32]);
        Ok(secret)
    }

    fn sign(&self, secret: &SecretKey, digest: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let message = secp256k1::Message::from_digest(*digest);
        let sig = SECP256K1.sign_ecdsa(&message, secret);
        Ok(sig.serialize_compact().to_vec())
    }

    fn verify(&self, pubkey: &PublicKey, digest: &[u8; 32], signature: &[u8]) -> bool {
        let message = secp256k1::Message::from_digest(*digest);
        let Ok(sig) = secp256k1::ecdsa::Signature::from_compact(signature) else { return false };
        SECP256K1.verify_ecdsa(&message, &sig, pubkey).is_ok()
    }
}

/// Derives the two session keys from an ECDH secret and the WHOAREYOU challenge data.
///
/// The salt is the full challenge data and the info line binds both node ids, so a key pair is
/// only ever valid for one handshake between one pair of nodes. Returns
/// `(initiator_key, recipient_key)`.
pub(crate) fn derive_session_keys(
    crypto: &dyn CryptoProvider,
    secret: &[u8],
    initiator_id: &NodeId,
    recipient_id: &NodeId,
    challenge_data: &[u8],
) -> Result<([u8; KEY_LENGTH], [u8; KEY_LENGTH]), CryptoError> {
    let mut info = Vec::with_capacity(KEY_AGREEMENT_TEXT.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_TEXT);
    info.extend_from_slice(&initiator_id.raw());
    info.extend_from_slice(&recipient_id.raw());

    let prk = crypto.hkdf_extract(challenge_data, secret);
    let mut okm = [0u8; 2 * KEY_LENGTH];
    crypto.hkdf_expand(&prk, &info, &mut okm)?;

    let mut initiator_key = [0u8; KEY_LENGTH];
    let mut recipient_key = [0u8; KEY_LENGTH];
    initiator_key.copy_from_slice(&okm[..KEY_LENGTH]);
    recipient_key.copy_from_slice(&okm[KEY_LENGTH..]);
    Ok((initiator_key, recipient_key))
}

/// The digest the handshake id-signature commits to.
fn id_signature_digest(
    crypto: &dyn CryptoProvider,
    challenge_data: &[u8],
    ephem_pubkey: &[u8],
    dst_id: &NodeId,
) -> [u8; 32] {
    let mut input =
        Vec::with_capacity(ID_SIGNATURE_TEXT.len() + challenge_data.len() + ephem_pubkey.len() + 32);
    input.extend_from_slice(ID_SIGNATURE_TEXT);
    input.extend_from_slice(challenge_data);
    input.extend_from_slice(ephem_pubkey);
    input.extend_from_slice(&dst_id.raw());
    crypto.sha256(&input)
}

/// Produces the id-signature proving possession of the static key for a handshake.
pub(crate) fn generate_id_signature(
    crypto: &dyn CryptoProvider,
    secret: &SecretKey,
    challenge_data: &[u8],
    ephem_pubkey: &[u8],
    dst_id: &NodeId,
) -> Result<Vec<u8>, CryptoError> {
    let digest = id_signature_digest(crypto, challenge_data, ephem_pubkey, dst_id);
    crypto.sign(secret, &digest)
}

/// Verifies a handshake id-signature against the sender's static public key.
pub(crate) fn verify_id_signature(
    crypto: &dyn CryptoProvider,
    signature: &[u8],
    pubkey: &PublicKey,
    challenge_data: &[u8],
    ephem_pubkey: &[u8],
    dst_id: &NodeId,
) -> bool {
    let digest = id_signature_digest(crypto, challenge_data, ephem_pubkey, dst_id);
    crypto.verify(pubkey, &digest, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::new(&mut rand::thread_rng());
        (secret, PublicKey::from_secret_key(SECP256K1, &secret))
    }

    #[test]
    fn test_ecdh_agreement_is_symmetric() {
        let crypto = DefaultCrypto;
        let (sec_a, pub_a) = keypair();
        let (sec_b, pub_b) = keypair();

        let shared_ab = crypto.ecdh(&pub_b.serialize(), &sec_a).unwrap();
        let shared_ba = crypto.ecdh(&pub_a.serialize(), &sec_b).unwrap();
        assert_eq!(shared_ab, shared_ba);
        assert_eq!(shared_ab.len(), PUBKEY_LENGTH);
        assert!(shared_ab[0] == 0x02 || shared_ab[0] == 0x03);
    }

    #[test]
    fn test_hkdf_is_deterministic() {
        let crypto = DefaultCrypto;
        let prk = crypto.hkdf_extract(b"salt", b"input keying material");
        let mut okm_a = [0u8; 32];
        let mut okm_b = [0u8; 32];
        crypto.hkdf_expand(&prk, b"info", &mut okm_a).unwrap();
        crypto.hkdf_expand(&prk, b"info", &mut okm_b).unwrap();
        assert_eq!(okm_a, okm_b);

        let mut okm_c = [0u8; 32];
        crypto.hkdf_expand(&prk, b"other info", &mut okm_c).unwrap();
        assert_ne!(okm_a, okm_c);
    }

    #[test]
    fn test_session_keys_match_between_roles() {
        let crypto = DefaultCrypto;
        let initiator = NodeId::random();
        let recipient = NodeId::random();
        let challenge_data = b"challenge bytes";
        let secret = b"ecdh secret";

        let a = derive_session_keys(&crypto, secret, &initiator, &recipient, challenge_data)
            .unwrap();
        let b = derive_session_keys(&crypto, secret, &initiator, &recipient, challenge_data)
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a.0, a.1);
    }

    #[test]
    fn test_gcm_ciphertext_length_and_round_trip() {
        let crypto = DefaultCrypto;
        let key = [7u8; KEY_LENGTH];
        let nonce = [9u8; 12];
        let aad = b"authenticated data";

        for len in [0usize, 1, 17, 512] {
            let plaintext = vec![0xabu8; len];
            let ct = crypto.aes_gcm_encrypt(&key, &nonce, aad, &plaintext).unwrap();
            assert_eq!(ct.len(), len + 16);
            let pt = crypto.aes_gcm_decrypt(&key, &nonce, aad, &ct).unwrap();
            assert_eq!(pt, plaintext);
        }
    }

    #[test]
    fn test_gcm_rejects_tampered_aad() {
        let crypto = DefaultCrypto;
        let key = [7u8; KEY_LENGTH];
        let nonce = [9u8; 12];
        let ct = crypto.aes_gcm_encrypt(&key, &nonce, b"aad", b"payload").unwrap();
        assert_eq!(
            crypto.aes_gcm_decrypt(&key, &nonce, b"bad", &ct),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_id_signature_round_trip() {
        let crypto = DefaultCrypto;
        let (secret, public) = keypair();
        let dst = NodeId::random();
        let (_, ephem_pub) = crypto.ephemeral_keypair();

        let sig =
            generate_id_signature(&crypto, &secret, b"challenge", &ephem_pub, &dst).unwrap();
        assert_eq!(sig.len(), SIGNATURE_LENGTH);
        assert!(verify_id_signature(&crypto, &sig, &public, b"challenge", &ephem_pub, &dst));

        // A different static key must not verify.
        let (_, other) = keypair();
        assert!(!verify_id_signature(&crypto, &sig, &other, b"challenge", &ephem_pub, &dst));
        // Nor a different challenge commitment.
        assert!(!verify_id_signature(&crypto, &sig, &public, b"challengf", &ephem_pub, &dst));
    }

    #[test]
    fn test_ctr_masking_round_trip() {
        let crypto = DefaultCrypto;
        let key = [3u8; KEY_LENGTH];
        let iv = [5u8; 16];
        let mut data = b"static header bytes".to_vec();
        let original = data.clone();

        crypto.aes_ctr_apply(&key, &iv, &mut data);
        assert_ne!(data, original);
        crypto.aes_ctr_apply(&key, &iv, &mut data);
        assert_eq!(data, original);
    }
}
