//! # TROPIC01 Host Driver
//!
//! Host-side driver stack for a TROPIC01 secure element on a polled serial
//! link.
//!
//! ## Overview
//!
//! The crate turns a half-duplex, polled byte link into an authenticated,
//! encrypted command channel:
//!
//! - **Link Transport (L1)**: chip-select framing, chip-mode polling, bounded
//!   retries and the optional reset line
//! - **Frame Protocol (L2)**: CRC-16 protected request/response frames, status
//!   decoding and the startup (reboot) sequence
//! - **Secure Session (L3)**: Noise KK1 handshake over X25519, AES-256-GCM
//!   command encryption with per-direction nonce counters, key zeroing on
//!   every exit path
//! - **Command Set**: ping, random values, user data slots, ECC keys, ECDSA
//! - **Mock Harness**: scripted link and a software chip model for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Device / command wrappers        │  ping, r_mem, ecc, ecdsa
//! ├─────────────────────────────────────────┤
//! │          Secure Session (L3)            │  AES-256-GCM, counters
//! ├─────────────────────────────────────────┤
//! │          Frame Protocol (L2)            │  id, len, payload, CRC-16
//! ├─────────────────────────────────────────┤
//! │          Link Transport (L1)            │  select, transfer, poll
//! ├─────────────────────────────────────────┤
//! │         LinkDriver (host supplied)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use driver::mock::{MockLink, SimulatedChip};
//! use driver::{ChipMode, Device, PairingKeySlot, TransportConfig};
//!
//! let chip = SimulatedChip::new(7);
//! let (private, public) = chip.provision_pairing_key(PairingKeySlot::SLOT_0);
//! let mut device = Device::new(MockLink::with_chip(&chip), TransportConfig::default());
//!
//! assert_eq!(device.init()?, ChipMode::Ready);
//! device.start_secure_session(&private, &public, PairingKeySlot::SLOT_0)?;
//!
//! let echo = device.ping(b"hello")?;
//! assert_eq!(echo.as_slice(), b"hello");
//!
//! device.abort_session();
//! device.deinit()?;
//! # Ok::<(), driver::Error>(())
//! ```
//!
//! ## Modules
//!
//! - [`link`]: the host link driver boundary
//! - [`l1`], [`l2`], [`l3`]: the protocol layers
//! - [`session`], [`handshake`]: secure session state and key schedule
//! - [`device`], [`commands`]: the device handle and typed commands
//! - [`mock`]: test doubles
//! - [`error`]: Error types

pub mod buffer;
pub mod certificate;
pub mod commands;
pub mod config;
pub mod crc;
pub mod crypto;
pub mod device;
pub mod error;
pub mod handshake;
pub mod l1;
pub mod l2;
pub mod l3;
pub mod link;
pub mod mock;
pub mod session;
pub mod startup;

pub use buffer::FrameBuffer;
pub use certificate::CertificateStore;
pub use commands::{
    EccCurve, EccKeyInfo, EccKeyOrigin, ECC_SLOT_MAX, PING_LEN_MAX, RANDOM_VALUE_LEN_MAX,
    R_MEM_DATA_SIZE_MAX, R_MEM_DATA_SLOT_MAX,
};
pub use config::{PollBudget, TransportConfig};
pub use crypto::{CryptoProvider, RustCrypto, SecretKey};
pub use device::{Device, InfoObject, RebootKind};
pub use error::{Error, Result};
pub use l1::{ChipMode, ModeFlags};
pub use l2::{ChipStatus, L2Status, Readiness};
pub use l3::{L3Response, ResultCode};
pub use link::{LinkDriver, LinkError};
pub use session::{PairingKeySlot, SecureSession, SessionState, PAIRING_KEY_SLOTS};
pub use startup::{StartupAction, StartupSequence, StartupState};
