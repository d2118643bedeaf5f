//! The device handle: one chip, one link, one secure session.

use std::time::Duration;

use zeroize::Zeroizing;

use crate::buffer::FrameBuffer;
use crate::certificate::{CertificateStore, CERT_STORE_MAX_BLOCKS, GET_INFO_BLOCK_LEN};
use crate::config::TransportConfig;
use crate::crypto::{CryptoProvider, RustCrypto, TAG_LEN, X25519_KEY_LEN};
use crate::error::{Error, Result};
use crate::handshake::{self, Transcript, HANDSHAKE_REQUEST_LEN, HANDSHAKE_RESPONSE_LEN};
use crate::l1::{ChipMode, Transport};
use crate::l2::{self, L2Status};
use crate::l3::{self, L3Response, L3_CMD_DATA_MAX, L3_PACKET_MAX};
use crate::link::LinkDriver;
use crate::session::{PairingKeySlot, SecureSession, SessionState};
use crate::startup::{StartupAction, StartupSequence, StartupState};

/// Objects readable with Get_Info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoObject {
    /// X.509 certificate store.
    CertificateStore,
    /// Chip identification block.
    ChipId,
    /// RISC-V firmware version.
    RiscvFirmwareVersion,
    /// SPECT firmware version.
    SpectFirmwareVersion,
}

impl InfoObject {
    /// Object id on the wire.
    pub fn id(self) -> u8 {
        match self {
            InfoObject::CertificateStore => 0x00,
            InfoObject::ChipId => 0x01,
            InfoObject::RiscvFirmwareVersion => 0x02,
            InfoObject::SpectFirmwareVersion => 0x04,
        }
    }
}

/// Startup request variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootKind {
    /// Boot into application firmware.
    Reboot,
    /// Stay in the bootloader for maintenance.
    Maintenance,
}

impl RebootKind {
    fn id(self) -> u8 {
        match self {
            RebootKind::Reboot => 0x01,
            RebootKind::Maintenance => 0x03,
        }
    }
}

const SLEEP_KIND_SLEEP: u8 = 0x05;

/// Handle for one secure element.
///
/// Not re-entrant: every operation runs one exchange to completion on the
/// calling thread.
pub struct Device<L: LinkDriver, C: CryptoProvider = RustCrypto> {
    transport: Transport<L>,
    buffer: FrameBuffer,
    crypto: C,
    mode: ChipMode,
    session: SecureSession,
    session_ttl: Option<Duration>,
    chip_static_public: Option<[u8; X25519_KEY_LEN]>,
}

impl<L: LinkDriver> Device<L, RustCrypto> {
    /// Handle using the default crypto provider.
    pub fn new(link: L, config: TransportConfig) -> Self {
        Self::with_crypto(link, RustCrypto, config)
    }
}

impl<L: LinkDriver, C: CryptoProvider> Device<L, C> {
    /// Handle using a caller-supplied crypto provider.
    pub fn with_crypto(link: L, crypto: C, config: TransportConfig) -> Self {
        Self {
            transport: Transport::new(link, config),
            buffer: FrameBuffer::new(),
            crypto,
            mode: ChipMode::Unknown,
            session: SecureSession::new(),
            session_ttl: None,
            chip_static_public: None,
        }
    }

    /// Last known chip mode.
    pub fn mode(&self) -> ChipMode {
        self.mode
    }

    /// The secure session.
    pub fn session(&self) -> &SecureSession {
        &self.session
    }

    /// Shorthand for `session().state()`.
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Time-to-live applied to sessions; `None` disables expiry.
    pub fn set_session_ttl(&mut self, ttl: Option<Duration>) {
        self.session_ttl = ttl;
    }

    /// Current session time-to-live.
    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl
    }

    /// The crypto provider.
    pub fn crypto(&self) -> &C {
        &self.crypto
    }

    /// The link driver.
    pub fn link(&self) -> &L {
        self.transport.link()
    }

    /// The link driver, mutably.
    pub fn link_mut(&mut self) -> &mut L {
        self.transport.link_mut()
    }

    /// Transport configuration.
    pub fn config(&self) -> &TransportConfig {
        self.transport.config()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring the chip into application mode.
    ///
    /// Safe to call again on a chip that is already ready. Returns
    /// [`ChipMode::Startup`] when the chip cannot leave its bootloader.
    pub fn init(&mut self) -> Result<ChipMode> {
        self.transport.link_mut().init()?;
        let mut sequence = self.startup_sequence();
        while !sequence.is_finished() {
            self.advance_startup(&mut sequence)?;
        }
        match sequence.final_mode() {
            Some(ChipMode::Ready) => tracing::info!("chip ready"),
            Some(mode) => tracing::warn!(%mode, "chip remains in startup mode"),
            None => {}
        }
        Ok(self.mode)
    }

    /// A startup sequence configured from this handle's transport settings.
    pub fn startup_sequence(&self) -> StartupSequence {
        let config = self.transport.config();
        StartupSequence::new(config.max_reboot_attempts, config.poll_budget)
    }

    /// Run the next step of `sequence` and return the state reached.
    pub fn advance_startup(&mut self, sequence: &mut StartupSequence) -> Result<StartupState> {
        match sequence.next_action() {
            StartupAction::Begin => sequence.begin(),
            StartupAction::PollMode => {
                let flags = self.transport.read_chip_status(&mut self.buffer)?;
                let delay = self.transport.config().poll_delay();
                let busy = sequence.observe(flags, delay)?;
                if busy {
                    self.transport.delay(delay);
                } else {
                    self.mode = flags.mode();
                }
            }
            StartupAction::Reboot => {
                tracing::info!(attempt = sequence.reboots_done() + 1, "rebooting chip out of startup mode");
                self.reboot(RebootKind::Reboot)?;
                sequence.rebooted();
            }
            StartupAction::Settle => sequence.settle(),
            StartupAction::Done => {}
        }
        if let Some(mode) = sequence.final_mode() {
            self.mode = mode;
        }
        tracing::debug!(state = ?sequence.state(), "startup step");
        Ok(sequence.state())
    }

    /// Tear down the session and release the link. The handle may be
    /// initialised again afterwards.
    pub fn deinit(&mut self) -> Result<()> {
        self.abort_session();
        self.mode = ChipMode::Unknown;
        self.buffer.clear();
        self.transport.link_mut().deinit()?;
        Ok(())
    }

    /// Poll the chip status byte and refresh the cached mode.
    pub fn chip_mode(&mut self) -> Result<ChipMode> {
        let mode = self.transport.read_chip_status(&mut self.buffer)?.mode();
        if mode != ChipMode::Unknown {
            self.mode = mode;
        }
        Ok(mode)
    }

    /// Send a startup request. The chip reboots, so any session is dropped
    /// and the mode must be polled again.
    pub fn reboot(&mut self, kind: RebootKind) -> Result<()> {
        l2::transceive(
            &mut self.transport,
            &mut self.buffer,
            l2::STARTUP_REQ_ID,
            &[kind.id()],
        )?;
        self.session.abort();
        self.mode = ChipMode::Unknown;
        let settle = self.transport.config().reboot_settle();
        self.transport.delay(settle);
        Ok(())
    }

    /// Pulse the reset line. Reports unsupported when the link has none.
    pub fn hardware_reset(&mut self) -> Result<()> {
        self.transport.hardware_reset()?;
        self.session.abort();
        self.mode = ChipMode::Unknown;
        Ok(())
    }

    /// Put the chip to sleep. The secure session does not survive.
    pub fn sleep(&mut self) -> Result<()> {
        self.ensure_mode(ChipMode::Ready)?;
        l2::transceive(
            &mut self.transport,
            &mut self.buffer,
            l2::SLEEP_REQ_ID,
            &[SLEEP_KIND_SLEEP],
        )?;
        self.session.abort();
        Ok(())
    }

    fn ensure_mode(&self, required: ChipMode) -> Result<()> {
        if self.mode == required {
            Ok(())
        } else {
            Err(Error::NotReady(self.mode))
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        match self.mode {
            ChipMode::Ready | ChipMode::Startup => Ok(()),
            other => Err(Error::NotReady(other)),
        }
    }

    // ========================================================================
    // Get_Info
    // ========================================================================

    /// Read one block of a Get_Info object.
    pub fn get_info(&mut self, object: InfoObject, block: u8) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        let response = l2::transceive(
            &mut self.transport,
            &mut self.buffer,
            l2::GET_INFO_REQ_ID,
            &[object.id(), block],
        )?;
        Ok(response.payload.to_vec())
    }

    /// Chip identification block.
    pub fn chip_id(&mut self) -> Result<Vec<u8>> {
        self.get_info(InfoObject::ChipId, 0)
    }

    /// Firmware version of the RISC-V core as `[build, patch, minor, major]`.
    pub fn firmware_version(&mut self) -> Result<[u8; 4]> {
        let raw = self.get_info(InfoObject::RiscvFirmwareVersion, 0)?;
        raw.as_slice().try_into().map_err(|_| {
            Error::UnexpectedResponse(format!("firmware version of {} bytes", raw.len()))
        })
    }

    /// Read and parse the certificate store.
    pub fn certificate_store(&mut self) -> Result<CertificateStore> {
        let mut raw = self.get_info(InfoObject::CertificateStore, 0)?;
        let total = CertificateStore::required_len(&raw)?;
        let mut block = 1;
        while raw.len() < total {
            if block >= CERT_STORE_MAX_BLOCKS {
                return Err(Error::UnexpectedResponse(
                    "certificate store exceeds readable blocks".to_string(),
                ));
            }
            let chunk = self.get_info(InfoObject::CertificateStore, block as u8)?;
            if chunk.is_empty() || chunk.len() > GET_INFO_BLOCK_LEN {
                return Err(Error::UnexpectedResponse(format!(
                    "certificate block {} has {} bytes",
                    block,
                    chunk.len()
                )));
            }
            raw.extend_from_slice(&chunk);
            block += 1;
        }
        CertificateStore::parse(&raw)
    }

    /// The chip's static X25519 key, read from the certificate store once and
    /// cached on the handle.
    pub fn chip_static_public(&mut self) -> Result<[u8; X25519_KEY_LEN]> {
        if let Some(key) = self.chip_static_public {
            return Ok(key);
        }
        let key = self.certificate_store()?.chip_static_public()?;
        self.chip_static_public = Some(key);
        Ok(key)
    }

    // ========================================================================
    // Secure session
    // ========================================================================

    /// Establish a secure session with the pairing key in `slot`.
    ///
    /// On failure the session is left `Inactive` with all derived material
    /// zeroed.
    pub fn start_secure_session(
        &mut self,
        pairing_private: &[u8; X25519_KEY_LEN],
        pairing_public: &[u8; X25519_KEY_LEN],
        slot: PairingKeySlot,
    ) -> Result<()> {
        self.ensure_mode(ChipMode::Ready)?;
        let chip_static = self.chip_static_public()?;

        tracing::debug!(slot = slot.index(), "starting secure session");
        self.session.begin_handshake();
        match self.handshake(pairing_private, pairing_public, &chip_static, slot) {
            Ok(keys) => {
                self.session.activate(slot, &keys.command, &keys.result);
                tracing::info!(slot = slot.index(), "secure session established");
                Ok(())
            }
            Err(err) => {
                self.session.handshake_failed();
                tracing::warn!(slot = slot.index(), error = %err, "handshake failed");
                Err(err)
            }
        }
    }

    fn handshake(
        &mut self,
        pairing_private: &[u8; X25519_KEY_LEN],
        pairing_public: &[u8; X25519_KEY_LEN],
        chip_static: &[u8; X25519_KEY_LEN],
        slot: PairingKeySlot,
    ) -> Result<handshake::SessionKeyMaterial> {
        let mut ephemeral = Zeroizing::new([0u8; X25519_KEY_LEN]);
        self.transport.random_bytes(&mut ephemeral[..])?;
        let ephemeral_public = self.crypto.x25519_public(&ephemeral);

        let mut request = [0u8; HANDSHAKE_REQUEST_LEN];
        request[..X25519_KEY_LEN].copy_from_slice(&ephemeral_public);
        request[X25519_KEY_LEN] = slot.index();

        let (chip_ephemeral, tag) = {
            let response = l2::transceive(
                &mut self.transport,
                &mut self.buffer,
                l2::HANDSHAKE_REQ_ID,
                &request,
            )
            .map_err(|err| match err {
                Error::RequestRejected(L2Status::HandshakeError) => {
                    Error::AuthenticationFailed("chip rejected the pairing key".to_string())
                }
                other => other,
            })?;
            if response.payload.len() != HANDSHAKE_RESPONSE_LEN {
                return Err(Error::UnexpectedResponse(format!(
                    "handshake response of {} bytes",
                    response.payload.len()
                )));
            }
            let mut chip_ephemeral = [0u8; X25519_KEY_LEN];
            let mut tag = [0u8; TAG_LEN];
            chip_ephemeral.copy_from_slice(&response.payload[..X25519_KEY_LEN]);
            tag.copy_from_slice(&response.payload[X25519_KEY_LEN..]);
            (chip_ephemeral, tag)
        };

        let transcript = Transcript {
            host_static: pairing_public,
            chip_static,
            host_ephemeral: &ephemeral_public,
            slot: slot.index(),
            chip_ephemeral: &chip_ephemeral,
        }
        .hash(&self.crypto);

        let keys = handshake::derive_initiator(
            &self.crypto,
            &ephemeral,
            pairing_private,
            &chip_ephemeral,
            chip_static,
        )
        .map_err(|err| Error::AuthenticationFailed(err.to_string()))?;
        handshake::verify_auth_tag(&self.crypto, &keys.auth, &transcript, &tag)?;
        Ok(keys)
    }

    /// Encrypt and send one L3 command, returning the decrypted result.
    ///
    /// Fails without any I/O unless the chip is in application mode and the
    /// session is `Active`. Once the command is sealed, any failure before the
    /// result authenticates faults the session, since the counters can no
    /// longer be trusted to match the chip. A chip seen leaving application
    /// mode reports [`Error::NotReady`] with the new mode.
    pub fn dispatch_secure_command(&mut self, command_id: u8, payload: &[u8]) -> Result<L3Response> {
        self.ensure_mode(ChipMode::Ready)?;
        self.session.enforce_ttl(self.session_ttl)?;
        self.session.ensure_active()?;
        if payload.len() > L3_CMD_DATA_MAX {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: L3_CMD_DATA_MAX,
            });
        }

        let mut plaintext = Zeroizing::new(Vec::with_capacity(1 + payload.len()));
        plaintext.push(command_id);
        plaintext.extend_from_slice(payload);
        let sealed = self.session.seal(&self.crypto, &plaintext)?;
        let packet = l3::encode_packet(&sealed)?;

        tracing::trace!(command_id, counter = self.session.send_counter() - 1, "l3 dispatch");
        self.transport.forget_observed();
        let exchanged = self.exchange_packet(&packet);
        if let Some(mode) = self.mode_change_observed() {
            tracing::warn!(%mode, "chip left application mode during a session");
            self.mode = mode;
            self.session.fault("chip left application mode");
            return Err(Error::NotReady(mode));
        }
        let received = match exchanged {
            Ok(received) => received,
            Err(err) => return Err(self.session_transport_failure(err)),
        };
        let sealed_result = match l3::decode_packet(&received) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.session.fault("malformed result packet");
                return Err(Error::SessionFault(err.to_string()));
            }
        };
        let plaintext = self.session.open(&self.crypto, sealed_result)?;
        L3Response::from_plaintext(&plaintext)
    }

    fn exchange_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        l2::send_encrypted(&mut self.transport, &mut self.buffer, packet)?;
        let mut received = Vec::new();
        l2::receive_encrypted(&mut self.transport, &mut self.buffer, &mut received, L3_PACKET_MAX)?;
        Ok(received)
    }

    fn mode_change_observed(&self) -> Option<ChipMode> {
        match self.transport.last_observed()?.mode() {
            mode @ (ChipMode::Startup | ChipMode::Alarm) => Some(mode),
            _ => None,
        }
    }

    fn session_transport_failure(&mut self, err: Error) -> Error {
        match err {
            Error::RequestRejected(status @ (L2Status::TagError | L2Status::NoSession)) => {
                self.session.fault("chip dropped the session");
                Error::SessionFault(format!("chip reported {}", status))
            }
            other => {
                tracing::warn!(error = %other, "secure exchange interrupted");
                self.session.fault("exchange interrupted");
                Error::SessionFault(format!("exchange interrupted: {}", other))
            }
        }
    }

    /// Tear down the session locally, then tell the chip.
    ///
    /// Returns false when there was no session to abort. Chip notification is
    /// best effort.
    pub fn abort_session(&mut self) -> bool {
        if !self.session.abort() {
            return false;
        }
        tracing::info!("secure session aborted");
        if self.mode == ChipMode::Ready {
            if let Err(err) = l2::transceive(
                &mut self.transport,
                &mut self.buffer,
                l2::ENCRYPTED_SESSION_ABT_REQ_ID,
                &[],
            ) {
                tracing::warn!(error = %err, "chip was not notified of session abort");
            }
        }
        true
    }

    /// Fill `out` from the host random source.
    pub fn host_random(&mut self, out: &mut [u8]) -> Result<()> {
        self.transport.random_bytes(out)
    }
}

impl<L: LinkDriver, C: CryptoProvider> std::fmt::Debug for Device<L, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("mode", &self.mode)
            .field("session", &self.session)
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}
