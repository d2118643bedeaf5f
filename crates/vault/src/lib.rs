//! # TROPIC01 Vault
//!
//! A name-based secret vault backed by a TROPIC01 secure element.
//!
//! ## Overview
//!
//! - **Secrets**: values up to 444 bytes stored in the chip's user data slots,
//!   addressed by name, with rotation and per-entry metadata
//! - **Sessions**: every operation except [`Vault::discover`] runs inside an
//!   authenticated, time-limited secure session
//! - **Hardware extension**: challenge-response attestation, chip-resident
//!   P-256 signing keys, attestation of individual secrets
//!
//! ## Example Usage
//!
//! ```rust
//! use driver::mock::{MockLink, SimulatedChip};
//! use driver::PairingKeySlot;
//! use vault::{Config, Vault};
//!
//! let chip = SimulatedChip::new(42);
//! let (private, public) = chip.provision_pairing_key(PairingKeySlot::SLOT_0);
//!
//! let mut vault = Vault::new(MockLink::with_chip(&chip), Config::default());
//! vault.init()?;
//! vault.authenticate(Some("payments"), &private, &public)?;
//!
//! vault.store("db_password", b"hunter2")?;
//! assert_eq!(vault.retrieve("db_password")?.as_slice(), b"hunter2");
//!
//! vault.close();
//! vault.deinit()?;
//! # Ok::<(), vault::VaultError>(())
//! ```
//!
//! ## Modules
//!
//! - [`api`]: the [`Vault`] handle
//! - [`catalog`]: name to slot mapping and name rules
//! - [`config`]: TOML configuration
//! - [`logging`]: tracing subscriber setup
//! - [`error`]: Error types

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;

pub use api::{Attestation, Discovery, SessionInfo, SigningKey, Vault, AVP_VERSION};
pub use catalog::{validate_name, SecretMetadata, SlotCatalog, MAX_NAME_LEN};
pub use config::{default_config_path, Config, ConfigError};
pub use error::{Result, VaultError};
