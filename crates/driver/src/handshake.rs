//! Secure session handshake: Noise KK1 key schedule.
//!
//! Both sides already know each other's static key (the host's pairing key
//! is provisioned into a chip slot; the chip's key is in its certificate),
//! so one round trip suffices:
//!
//! ```text
//! -> e, pkey_index
//! <- e, ee, se, es, t_auth
//! ```
//!
//! The chip's `t_auth` is an AES-GCM tag over an empty plaintext with the
//! transcript hash as associated data, proving it derived the same keys.

use std::fmt;

use zeroize::Zeroizing;

use crate::crypto::{CryptoProvider, SecretKey, DIGEST_LEN, NONCE_LEN, TAG_LEN, X25519_KEY_LEN};
use crate::error::{Error, Result};

/// Protocol name, zero padded to one hash block input.
pub const PROTOCOL_NAME: [u8; 32] = *b"Noise_KK1_25519_AESGCM_SHA256\0\0\0";

/// Handshake request payload: ephemeral public key + pairing key index.
pub const HANDSHAKE_REQUEST_LEN: usize = X25519_KEY_LEN + 1;

/// Handshake response payload: chip ephemeral public key + auth tag.
pub const HANDSHAKE_RESPONSE_LEN: usize = X25519_KEY_LEN + TAG_LEN;

/// Keys produced by a completed key schedule.
pub struct SessionKeyMaterial {
    /// Encrypts host-to-chip commands.
    pub command: SecretKey,
    /// Encrypts chip-to-host results.
    pub result: SecretKey,
    /// Authenticates the handshake transcript.
    pub auth: SecretKey,
}

impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("command", &"[redacted]")
            .field("result", &"[redacted]")
            .field("auth", &"[redacted]")
            .finish()
    }
}

/// Public inputs of the transcript hash.
#[derive(Debug, Clone, Copy)]
pub struct Transcript<'a> {
    /// Host pairing public key.
    pub host_static: &'a [u8; X25519_KEY_LEN],
    /// Chip static public key.
    pub chip_static: &'a [u8; X25519_KEY_LEN],
    /// Host ephemeral public key.
    pub host_ephemeral: &'a [u8; X25519_KEY_LEN],
    /// Pairing key slot index.
    pub slot: u8,
    /// Chip ephemeral public key.
    pub chip_ephemeral: &'a [u8; X25519_KEY_LEN],
}

impl Transcript<'_> {
    /// Chained SHA-256 over the protocol name and every public input.
    pub fn hash<C: CryptoProvider>(&self, crypto: &C) -> [u8; DIGEST_LEN] {
        let mut h = crypto.sha256(&[&PROTOCOL_NAME]);
        h = crypto.sha256(&[&h, self.host_static]);
        h = crypto.sha256(&[&h, self.chip_static]);
        h = crypto.sha256(&[&h, self.host_ephemeral]);
        h = crypto.sha256(&[&h, &[self.slot]]);
        crypto.sha256(&[&h, self.chip_ephemeral])
    }
}

fn schedule<C: CryptoProvider>(
    crypto: &C,
    ee: &[u8; X25519_KEY_LEN],
    se: &[u8; X25519_KEY_LEN],
    es: &[u8; X25519_KEY_LEN],
) -> Result<SessionKeyMaterial> {
    let (ck, _) = crypto.hkdf_pair(&PROTOCOL_NAME, ee)?;
    let (ck, _) = crypto.hkdf_pair(&ck[..], se)?;
    let (ck, auth) = crypto.hkdf_pair(&ck[..], es)?;
    let (command, result) = crypto.hkdf_pair(&ck[..], &[])?;
    Ok(SessionKeyMaterial {
        command,
        result,
        auth,
    })
}

/// Host side key schedule.
pub fn derive_initiator<C: CryptoProvider>(
    crypto: &C,
    host_ephemeral_secret: &[u8; X25519_KEY_LEN],
    host_static_secret: &[u8; X25519_KEY_LEN],
    chip_ephemeral: &[u8; X25519_KEY_LEN],
    chip_static: &[u8; X25519_KEY_LEN],
) -> Result<SessionKeyMaterial> {
    let ee = crypto.x25519(host_ephemeral_secret, chip_ephemeral)?;
    let se = crypto.x25519(host_static_secret, chip_ephemeral)?;
    let es = crypto.x25519(host_ephemeral_secret, chip_static)?;
    schedule(crypto, &ee, &se, &es)
}

/// Chip side key schedule; yields the same keys as [`derive_initiator`].
pub fn derive_responder<C: CryptoProvider>(
    crypto: &C,
    chip_ephemeral_secret: &[u8; X25519_KEY_LEN],
    chip_static_secret: &[u8; X25519_KEY_LEN],
    host_ephemeral: &[u8; X25519_KEY_LEN],
    host_static: &[u8; X25519_KEY_LEN],
) -> Result<SessionKeyMaterial> {
    let ee = crypto.x25519(chip_ephemeral_secret, host_ephemeral)?;
    let se = crypto.x25519(chip_ephemeral_secret, host_static)?;
    let es = crypto.x25519(chip_static_secret, host_ephemeral)?;
    schedule(crypto, &ee, &se, &es)
}

/// Tag the chip sends to prove key agreement.
pub fn auth_tag<C: CryptoProvider>(
    crypto: &C,
    auth: &SecretKey,
    transcript_hash: &[u8; DIGEST_LEN],
) -> Result<[u8; TAG_LEN]> {
    let sealed = crypto.aead_seal(auth, &[0u8; NONCE_LEN], transcript_hash, &[])?;
    sealed
        .as_slice()
        .try_into()
        .map_err(|_| Error::Crypto(format!("auth tag has {} bytes", sealed.len())))
}

/// Check the chip's `t_auth` against the locally derived keys.
pub fn verify_auth_tag<C: CryptoProvider>(
    crypto: &C,
    auth: &SecretKey,
    transcript_hash: &[u8; DIGEST_LEN],
    tag: &[u8; TAG_LEN],
) -> Result<()> {
    let opened: Zeroizing<Vec<u8>> = crypto
        .aead_open(auth, &[0u8; NONCE_LEN], transcript_hash, tag)
        .map_err(|_| Error::AuthenticationFailed("handshake tag mismatch".to_string()))?;
    if !opened.is_empty() {
        return Err(Error::AuthenticationFailed(
            "handshake tag carried data".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCrypto;

    struct Parties {
        host_static: [u8; 32],
        host_ephemeral: [u8; 32],
        chip_static: [u8; 32],
        chip_ephemeral: [u8; 32],
    }

    fn parties() -> Parties {
        Parties {
            host_static: [0x10; 32],
            host_ephemeral: [0x20; 32],
            chip_static: [0x30; 32],
            chip_ephemeral: [0x40; 32],
        }
    }

    #[test]
    fn test_protocol_name_padding() {
        assert_eq!(&PROTOCOL_NAME[..29], b"Noise_KK1_25519_AESGCM_SHA256");
        assert_eq!(&PROTOCOL_NAME[29..], &[0, 0, 0]);
    }

    #[test]
    fn test_initiator_and_responder_agree() {
        let c = RustCrypto;
        let p = parties();
        let host = derive_initiator(
            &c,
            &p.host_ephemeral,
            &p.host_static,
            &c.x25519_public(&p.chip_ephemeral),
            &c.x25519_public(&p.chip_static),
        )
        .unwrap();
        let chip = derive_responder(
            &c,
            &p.chip_ephemeral,
            &p.chip_static,
            &c.x25519_public(&p.host_ephemeral),
            &c.x25519_public(&p.host_static),
        )
        .unwrap();

        assert_eq!(*host.command, *chip.command);
        assert_eq!(*host.result, *chip.result);
        assert_eq!(*host.auth, *chip.auth);
        assert_ne!(*host.command, *host.result);
    }

    #[test]
    fn test_transcript_binds_slot() {
        let c = RustCrypto;
        let key = [7u8; 32];
        let mut transcript = Transcript {
            host_static: &key,
            chip_static: &key,
            host_ephemeral: &key,
            slot: 0,
            chip_ephemeral: &key,
        };
        let first = transcript.hash(&c);
        transcript.slot = 1;
        assert_ne!(first, transcript.hash(&c));
    }

    #[test]
    fn test_auth_tag_verifies() {
        let c = RustCrypto;
        let auth = Zeroizing::new([9u8; 32]);
        let hash = [3u8; 32];
        let tag = auth_tag(&c, &auth, &hash).unwrap();
        assert!(verify_auth_tag(&c, &auth, &hash, &tag).is_ok());
    }

    #[test]
    fn test_wrong_auth_tag_is_authentication_failure() {
        let c = RustCrypto;
        let auth = Zeroizing::new([9u8; 32]);
        let hash = [3u8; 32];
        let mut tag = auth_tag(&c, &auth, &hash).unwrap();
        tag[0] ^= 1;
        assert!(matches!(
            verify_auth_tag(&c, &auth, &hash, &tag),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_key_material_debug_is_redacted() {
        let c = RustCrypto;
        let p = parties();
        let keys = derive_initiator(
            &c,
            &p.host_ephemeral,
            &p.host_static,
            &c.x25519_public(&p.chip_ephemeral),
            &c.x25519_public(&p.chip_static),
        )
        .unwrap();
        let printed = format!("{:?}", keys);
        assert!(printed.contains("[redacted]"));
        assert!(!printed.contains(&format!("{:?}", *keys.command)));
    }
}
