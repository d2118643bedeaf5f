//! Secure session state and the encrypted channel's key material.
//!
//! The session owns both directional keys and their nonce counters. Keys are
//! overwritten with zeros on abort, fault, expiry, a failed handshake, and
//! when the session is dropped.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{CryptoProvider, KEY_LEN, NONCE_LEN};
use crate::error::{Error, Result};

/// Number of pairing key slots on the chip.
pub const PAIRING_KEY_SLOTS: u8 = 4;

/// Lifecycle of a secure session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been established.
    Inactive,
    /// A handshake is in flight.
    Handshaking,
    /// Keys are live; encrypted commands may be dispatched.
    Active,
    /// Torn down by the caller.
    Aborted,
    /// Torn down because the time-to-live elapsed.
    Expired,
    /// Torn down after a protocol or authentication failure.
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Inactive => "inactive",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Aborted => "aborted",
            SessionState::Expired => "expired",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Index of a pairing key slot (0..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PairingKeySlot(u8);

impl PairingKeySlot {
    /// Slot 0, provisioned at manufacturing.
    pub const SLOT_0: PairingKeySlot = PairingKeySlot(0);

    /// Validate a slot index.
    pub fn new(index: u8) -> Option<Self> {
        (index < PAIRING_KEY_SLOTS).then_some(Self(index))
    }

    /// Raw index as sent in the handshake request.
    #[inline]
    pub fn index(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PairingKeySlot {
    type Error = String;

    fn try_from(index: u8) -> std::result::Result<Self, Self::Error> {
        Self::new(index).ok_or_else(|| {
            format!(
                "pairing key slot must be below {}, got {}",
                PAIRING_KEY_SLOTS, index
            )
        })
    }
}

impl From<PairingKeySlot> for u8 {
    fn from(slot: PairingKeySlot) -> Self {
        slot.0
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct DirectionalKeys {
    command: [u8; KEY_LEN],
    result: [u8; KEY_LEN],
}

impl DirectionalKeys {
    fn zeroed() -> Self {
        Self {
            command: [0u8; KEY_LEN],
            result: [0u8; KEY_LEN],
        }
    }

    fn is_zero(&self) -> bool {
        self.command.iter().chain(self.result.iter()).all(|&b| b == 0)
    }
}

/// Build the 12-byte AES-GCM nonce for `counter`.
///
/// The counter occupies the first four bytes, little-endian.
pub fn nonce_for(counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// The encrypted channel between host and chip.
pub struct SecureSession {
    state: SessionState,
    slot: Option<PairingKeySlot>,
    keys: DirectionalKeys,
    send_counter: u32,
    receive_counter: u32,
    established_at: Option<Instant>,
}

impl SecureSession {
    /// A session in the `Inactive` state with no key material.
    pub fn new() -> Self {
        Self {
            state: SessionState::Inactive,
            slot: None,
            keys: DirectionalKeys::zeroed(),
            send_counter: 0,
            receive_counter: 0,
            established_at: None,
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True when commands may be dispatched.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Pairing key slot of the live session.
    pub fn slot(&self) -> Option<PairingKeySlot> {
        self.slot
    }

    /// Nonce counter for the next command.
    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    /// Nonce counter expected on the next result.
    pub fn receive_counter(&self) -> u32 {
        self.receive_counter
    }

    /// When the handshake completed.
    pub fn established_at(&self) -> Option<Instant> {
        self.established_at
    }

    /// True when every key byte and both counters are zero.
    pub fn is_zeroized(&self) -> bool {
        self.keys.is_zero() && self.send_counter == 0 && self.receive_counter == 0
    }

    pub(crate) fn begin_handshake(&mut self) {
        self.wipe();
        self.state = SessionState::Handshaking;
    }

    pub(crate) fn activate(
        &mut self,
        slot: PairingKeySlot,
        command: &[u8; KEY_LEN],
        result: &[u8; KEY_LEN],
    ) {
        self.keys.command.copy_from_slice(command);
        self.keys.result.copy_from_slice(result);
        self.send_counter = 0;
        self.receive_counter = 0;
        self.slot = Some(slot);
        self.established_at = Some(Instant::now());
        self.state = SessionState::Active;
    }

    pub(crate) fn handshake_failed(&mut self) {
        self.wipe();
        self.state = SessionState::Inactive;
    }

    /// Tear down a live or in-flight session. Returns false when there was
    /// nothing to tear down.
    pub(crate) fn abort(&mut self) -> bool {
        match self.state {
            SessionState::Active | SessionState::Handshaking => {
                self.wipe();
                self.state = SessionState::Aborted;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn fault(&mut self, reason: &str) {
        tracing::warn!(reason, state = %self.state, "secure session faulted");
        self.wipe();
        self.state = SessionState::Faulted;
    }

    /// Expire the session if it outlived `ttl`.
    pub(crate) fn enforce_ttl(&mut self, ttl: Option<Duration>) -> Result<()> {
        if let (SessionState::Active, Some(ttl), Some(established)) =
            (self.state, ttl, self.established_at)
        {
            if established.elapsed() >= ttl {
                tracing::info!(ttl_ms = ttl.as_millis() as u64, "secure session expired");
                self.wipe();
                self.state = SessionState::Expired;
                return Err(Error::SessionExpired);
            }
        }
        Ok(())
    }

    /// Fail unless the session is `Active`.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Expired => Err(Error::SessionExpired),
            other => Err(Error::NoSession(other)),
        }
    }

    /// Encrypt one command under the command key and advance the send counter.
    pub(crate) fn seal<C: CryptoProvider>(&mut self, crypto: &C, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.ensure_active()?;
        if self.send_counter == u32::MAX {
            self.fault("send counter exhausted");
            return Err(Error::SessionFault("send counter exhausted".to_string()));
        }

        let nonce = nonce_for(self.send_counter);
        match crypto.aead_seal(&self.keys.command, &nonce, &[], plaintext) {
            Ok(sealed) => {
                self.send_counter += 1;
                Ok(sealed)
            }
            Err(err) => {
                self.fault("command encryption failed");
                Err(Error::SessionFault(err.to_string()))
            }
        }
    }

    /// Decrypt one result under the result key.
    ///
    /// The receive counter advances only when the tag verifies. Any
    /// verification failure faults the session.
    pub(crate) fn open<C: CryptoProvider>(
        &mut self,
        crypto: &C,
        sealed: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_active()?;
        if self.receive_counter == u32::MAX {
            self.fault("receive counter exhausted");
            return Err(Error::SessionFault("receive counter exhausted".to_string()));
        }

        let nonce = nonce_for(self.receive_counter);
        match crypto.aead_open(&self.keys.result, &nonce, &[], sealed) {
            Ok(plaintext) => {
                self.receive_counter += 1;
                Ok(plaintext)
            }
            Err(_) => {
                self.fault("result authentication failed");
                Err(Error::SessionFault(
                    "result authentication failed".to_string(),
                ))
            }
        }
    }

    fn wipe(&mut self) {
        self.keys.zeroize();
        self.send_counter = 0;
        self.receive_counter = 0;
        self.slot = None;
        self.established_at = None;
    }
}

impl Default for SecureSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("state", &self.state)
            .field("slot", &self.slot)
            .field("send_counter", &self.send_counter)
            .field("receive_counter", &self.receive_counter)
            .field("keys", &"[redacted]")
            .finish()
    }
}
