//! Crypto provider boundary.
//!
//! The driver never calls a cipher directly; it goes through
//! [`CryptoProvider`] so a host can substitute an accelerator or a vetted
//! library. [`RustCrypto`] is the default backend.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature as EcdsaSignature, VerifyingKey};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// AES-256 key size.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce size.
pub const NONCE_LEN: usize = 12;
/// AES-GCM tag size.
pub const TAG_LEN: usize = 16;
/// SHA-256 digest size.
pub const DIGEST_LEN: usize = 32;
/// X25519 key size.
pub const X25519_KEY_LEN: usize = 32;
/// Uncompressed P-256 public key without the SEC1 prefix byte.
pub const P256_PUBLIC_KEY_LEN: usize = 64;
/// Raw `r || s` P-256 signature.
pub const P256_SIGNATURE_LEN: usize = 64;

/// A 32-byte secret that is zeroed when dropped.
pub type SecretKey = Zeroizing<[u8; KEY_LEN]>;

/// Primitives consumed by the handshake and the encrypted channel.
///
/// Implementations must fail closed: a tampered ciphertext or tag is an
/// error, never a partial plaintext.
pub trait CryptoProvider {
    /// SHA-256 over the concatenation of `parts`.
    fn sha256(&self, parts: &[&[u8]]) -> [u8; DIGEST_LEN];

    /// HKDF-SHA256: extract with `salt`, expand 64 bytes with empty info,
    /// split into two keys.
    fn hkdf_pair(&self, salt: &[u8], ikm: &[u8]) -> Result<(SecretKey, SecretKey)>;

    /// X25519 public key for `secret`.
    fn x25519_public(&self, secret: &[u8; X25519_KEY_LEN]) -> [u8; X25519_KEY_LEN];

    /// X25519 shared secret. Fails when the peer key yields a
    /// non-contributory result.
    fn x25519(
        &self,
        secret: &[u8; X25519_KEY_LEN],
        public: &[u8; X25519_KEY_LEN],
    ) -> Result<SecretKey>;

    /// AES-256-GCM encrypt; returns ciphertext followed by the tag.
    fn aead_seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    /// AES-256-GCM decrypt of ciphertext followed by the tag.
    fn aead_open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Verify a P-256 ECDSA signature over a precomputed digest.
    ///
    /// Returns `Ok(false)` for a well-formed but invalid signature.
    fn ecdsa_p256_verify(
        &self,
        public_key: &[u8; P256_PUBLIC_KEY_LEN],
        digest: &[u8; DIGEST_LEN],
        signature: &[u8; P256_SIGNATURE_LEN],
    ) -> Result<bool>;
}

/// Default provider built on the RustCrypto crates and x25519-dalek.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCrypto;

impl CryptoProvider for RustCrypto {
    fn sha256(&self, parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    fn hkdf_pair(&self, salt: &[u8], ikm: &[u8]) -> Result<(SecretKey, SecretKey)> {
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = Zeroizing::new([0u8; 2 * KEY_LEN]);
        hk.expand(&[], &mut okm[..])
            .map_err(|e| Error::Crypto(format!("hkdf expand failed: {}", e)))?;

        let mut first = Zeroizing::new([0u8; KEY_LEN]);
        let mut second = Zeroizing::new([0u8; KEY_LEN]);
        first.copy_from_slice(&okm[..KEY_LEN]);
        second.copy_from_slice(&okm[KEY_LEN..]);
        Ok((first, second))
    }

    fn x25519_public(&self, secret: &[u8; X25519_KEY_LEN]) -> [u8; X25519_KEY_LEN] {
        let secret = StaticSecret::from(*secret);
        PublicKey::from(&secret).to_bytes()
    }

    fn x25519(
        &self,
        secret: &[u8; X25519_KEY_LEN],
        public: &[u8; X25519_KEY_LEN],
    ) -> Result<SecretKey> {
        let secret = StaticSecret::from(*secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*public));
        if !shared.was_contributory() {
            return Err(Error::Crypto("x25519 result is not contributory".to_string()));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }

    fn aead_seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("invalid aes key: {}", e)))?;
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto("aes-gcm encryption failed".to_string()))
    }

    fn aead_open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("invalid aes key: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
            .map(Zeroizing::new)
            .map_err(|_| Error::Crypto("aes-gcm authentication failed".to_string()))
    }

    fn ecdsa_p256_verify(
        &self,
        public_key: &[u8; P256_PUBLIC_KEY_LEN],
        digest: &[u8; DIGEST_LEN],
        signature: &[u8; P256_SIGNATURE_LEN],
    ) -> Result<bool> {
        let mut sec1 = [0u8; 1 + P256_PUBLIC_KEY_LEN];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(public_key);
        let key = VerifyingKey::from_sec1_bytes(&sec1)
            .map_err(|e| Error::Crypto(format!("invalid p256 public key: {}", e)))?;
        let signature = match EcdsaSignature::from_slice(signature) {
            Ok(signature) => signature,
            Err(_) => return Ok(false),
        };
        Ok(key.verify_prehash(digest, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::SigningKey;

    #[test]
    fn test_sha256_known_vector() {
        let digest = RustCrypto.sha256(&[b"ab", b"c"]);
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hkdf_pair_is_deterministic_and_split() {
        let (a1, b1) = RustCrypto.hkdf_pair(&[1u8; 32], b"input").unwrap();
        let (a2, b2) = RustCrypto.hkdf_pair(&[1u8; 32], b"input").unwrap();
        assert_eq!(*a1, *a2);
        assert_eq!(*b1, *b2);
        assert_ne!(*a1, *b1);

        let (a3, _) = RustCrypto.hkdf_pair(&[2u8; 32], b"input").unwrap();
        assert_ne!(*a1, *a3);
    }

    #[test]
    fn test_x25519_agreement() {
        let alice = [0x11u8; 32];
        let bob = [0x22u8; 32];
        let alice_pub = RustCrypto.x25519_public(&alice);
        let bob_pub = RustCrypto.x25519_public(&bob);

        let ab = RustCrypto.x25519(&alice, &bob_pub).unwrap();
        let ba = RustCrypto.x25519(&bob, &alice_pub).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_x25519_rejects_low_order_point() {
        let result = RustCrypto.x25519(&[0x11u8; 32], &[0u8; 32]);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn test_aead_roundtrip() {
        let key = [0x42u8; 32];
        let nonce = [0x01u8; 12];
        let sealed = RustCrypto.aead_seal(&key, &nonce, b"ad", b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_LEN);

        let opened = RustCrypto.aead_open(&key, &nonce, b"ad", &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"hello");
    }

    #[test]
    fn test_aead_tamper_fails_closed() {
        let key = [0x42u8; 32];
        let nonce = [0x01u8; 12];
        let mut sealed = RustCrypto.aead_seal(&key, &nonce, &[], b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert!(RustCrypto.aead_open(&key, &nonce, &[], &sealed).is_err());
    }

    #[test]
    fn test_aead_wrong_nonce_fails() {
        let key = [0x42u8; 32];
        let sealed = RustCrypto.aead_seal(&key, &[0u8; 12], &[], b"x").unwrap();
        assert!(RustCrypto.aead_open(&key, &[1u8; 12], &[], &sealed).is_err());
    }

    #[test]
    fn test_ecdsa_verify() {
        let signing = SigningKey::from_slice(&[0x07u8; 32]).unwrap();
        let point = signing.verifying_key().to_encoded_point(false);
        let mut public = [0u8; 64];
        public.copy_from_slice(&point.as_bytes()[1..]);

        let digest = RustCrypto.sha256(&[b"message"]);
        let signature: EcdsaSignature = signing.sign_prehash(&digest).unwrap();
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&signature.to_bytes());

        assert!(RustCrypto.ecdsa_p256_verify(&public, &digest, &raw).unwrap());

        let other = RustCrypto.sha256(&[b"other"]);
        assert!(!RustCrypto.ecdsa_p256_verify(&public, &other, &raw).unwrap());
    }

    #[test]
    fn test_ecdsa_rejects_invalid_key() {
        let result = RustCrypto.ecdsa_p256_verify(&[0u8; 64], &[0u8; 32], &[1u8; 64]);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }
}
