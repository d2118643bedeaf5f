//! Deterministic stand-ins for the link driver and the chip.
//!
//! [`MockLink`] plays back scripted responses, one entry per chip-select
//! transaction. A [`SimulatedChip`] can be attached as a responder so that
//! transactions with no scripted entry are answered by a software model of the
//! chip, which is enough to run the handshake and the L3 command set end to
//! end.
//!
//! An empty queue with no responder attached panics: it is always a test
//! authoring bug, never a chip behaviour, and must not look like a timeout.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::certificate::{device_certificate_with_key, CertificateStore, GET_INFO_BLOCK_LEN};
use crate::crc;
use crate::crypto::{CryptoProvider, RustCrypto, KEY_LEN, TAG_LEN, X25519_KEY_LEN};
use crate::handshake::{self, Transcript, HANDSHAKE_REQUEST_LEN};
use crate::l1::{ModeFlags, GET_RESPONSE_REQ_ID, L2_CHUNK_MAX_DATA, STATUS_NO_RESPONSE};
use crate::l2::{self, L2Status};
use crate::l3::{command, ResultCode, L3_SIZE_LEN};
use crate::link::{LinkDriver, LinkError};
use crate::session::{nonce_for, PairingKeySlot, PAIRING_KEY_SLOTS};

/// Build a response frame with a valid CRC trailer.
pub fn response_frame(chip_status: u8, status: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(3 + data.len() + crc::CRC_LEN);
    frame.push(chip_status);
    frame.push(status);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    let trailer = crc::trailer(&frame[1..]);
    frame.extend_from_slice(&trailer);
    frame
}

/// What a scripted reply closure can see.
pub struct ReplyContext<'a> {
    requests: &'a [Vec<u8>],
}

impl ReplyContext<'_> {
    /// Every request frame written so far, oldest first.
    pub fn requests(&self) -> &[Vec<u8>] {
        self.requests
    }

    /// The most recent request frame.
    pub fn last_request(&self) -> Option<&[u8]> {
        self.requests.last().map(Vec::as_slice)
    }
}

type ReplyFn = Box<dyn FnOnce(&ReplyContext<'_>) -> Vec<Vec<u8>>>;

enum Scripted {
    Bytes(Vec<u8>),
    Reply(ReplyFn),
}

/// Chip-side model consulted when the scripted queue is empty.
pub trait Responder {
    /// Chip status byte for the next transaction.
    fn status(&mut self) -> u8;

    /// The response frame the chip would deliver on the next poll, without
    /// consuming it.
    fn peek_response(&mut self) -> Option<Vec<u8>>;

    /// Drop the response returned by the last `peek_response`.
    fn consume_response(&mut self);

    /// A complete request frame was written.
    fn request(&mut self, frame: &[u8]);
}

#[derive(Default)]
struct Transaction {
    response: Option<Vec<u8>>,
    from_responder: bool,
    scripted: bool,
    position: usize,
    written: Vec<u8>,
}

struct LinkState {
    queue: VecDeque<Scripted>,
    responder: Option<Box<dyn Responder>>,
    transaction: Transaction,
    selected: bool,
    select_stuck: Option<bool>,
    fail_next: Option<LinkError>,
    reset_supported: bool,
    reset_events: Vec<bool>,
    delays: Vec<Duration>,
    transfers: usize,
    requests: Vec<Vec<u8>>,
    rng: StdRng,
    init_calls: usize,
    deinit_calls: usize,
}

/// Scripted link driver.
///
/// Clones share state, so a test keeps one clone for scripting and inspection
/// while the device owns another.
#[derive(Clone)]
pub struct MockLink {
    state: Rc<RefCell<LinkState>>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Empty link with a fixed RNG seed.
    pub fn new() -> Self {
        Self::with_seed(0x7209_0001)
    }

    /// Empty link whose random source is seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(LinkState {
                queue: VecDeque::new(),
                responder: None,
                transaction: Transaction::default(),
                selected: false,
                select_stuck: None,
                fail_next: None,
                reset_supported: false,
                reset_events: Vec::new(),
                delays: Vec::new(),
                transfers: 0,
                requests: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
                init_calls: 0,
                deinit_calls: 0,
            })),
        }
    }

    /// Link answered by `chip` whenever nothing is scripted.
    pub fn with_chip(chip: &SimulatedChip) -> Self {
        let link = Self::new();
        link.attach(chip.clone());
        link
    }

    /// Install a responder for transactions with no scripted entry.
    pub fn attach(&self, responder: impl Responder + 'static) {
        self.state.borrow_mut().responder = Some(Box::new(responder));
    }

    /// Queue the read side of one transaction.
    ///
    /// A write clocks out zeros once the entry runs out. A response read that
    /// runs past the end panics, as the script is then shorter than the frame
    /// the host expects.
    pub fn enqueue_response(&self, bytes: Vec<u8>) {
        self.state.borrow_mut().queue.push_back(Scripted::Bytes(bytes));
    }

    /// Queue a reply computed when its transaction starts.
    ///
    /// The first returned entry answers that transaction; the rest are placed
    /// at the front of the queue in order.
    pub fn enqueue_reply(
        &self,
        reply: impl FnOnce(&ReplyContext<'_>) -> Vec<Vec<u8>> + 'static,
    ) {
        self.state
            .borrow_mut()
            .queue
            .push_back(Scripted::Reply(Box::new(reply)));
    }

    /// Queue the status byte the chip clocks out while a request is written.
    pub fn enqueue_write_ack(&self) {
        self.enqueue_response(vec![ModeFlags::READY]);
    }

    /// Queue a bare chip status byte, as seen by a mode poll.
    pub fn enqueue_chip_status(&self, status: u8) {
        self.enqueue_response(vec![status]);
    }

    /// Queue a complete response frame.
    pub fn enqueue_frame(&self, chip_status: u8, status: u8, data: &[u8]) {
        self.enqueue_response(response_frame(chip_status, status, data));
    }

    /// Scripted entries not yet consumed.
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Request frames written so far. Response polls are not included.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.borrow().requests.clone()
    }

    /// Number of successful `transfer` calls.
    pub fn transfer_count(&self) -> usize {
        self.state.borrow().transfers
    }

    /// Every delay requested through the link, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.state.borrow().delays.clone()
    }

    /// Levels driven onto the reset line, in order.
    pub fn reset_events(&self) -> Vec<bool> {
        self.state.borrow().reset_events.clone()
    }

    /// Give the link a working reset line.
    pub fn enable_reset(&self) {
        self.state.borrow_mut().reset_supported = true;
    }

    /// Force the select line read-back to a fixed level; `None` releases it.
    pub fn set_select_stuck(&self, level: Option<bool>) {
        self.state.borrow_mut().select_stuck = level;
    }

    /// Fail the next transfer with `err`.
    pub fn fail_next_transfer(&self, err: LinkError) {
        self.state.borrow_mut().fail_next = Some(err);
    }

    /// Whether chip select is currently asserted.
    pub fn is_selected_now(&self) -> bool {
        self.state.borrow().selected
    }

    /// Number of `init` calls.
    pub fn init_calls(&self) -> usize {
        self.state.borrow().init_calls
    }

    /// Number of `deinit` calls.
    pub fn deinit_calls(&self) -> usize {
        self.state.borrow().deinit_calls
    }
}

impl LinkState {
    fn start_response(&mut self, first_byte: u8) -> (Vec<u8>, bool) {
        if let Some(entry) = self.queue.pop_front() {
            let bytes = match entry {
                Scripted::Bytes(bytes) => bytes,
                Scripted::Reply(reply) => {
                    let mut entries = reply(&ReplyContext {
                        requests: &self.requests,
                    })
                    .into_iter();
                    let first = entries.next().unwrap_or_default();
                    let rest: Vec<Vec<u8>> = entries.collect();
                    for later in rest.into_iter().rev() {
                        self.queue.push_front(Scripted::Bytes(later));
                    }
                    first
                }
            };
            self.transaction.scripted = true;
            return (bytes, false);
        }

        match self.responder.as_mut() {
            Some(responder) => {
                let status = responder.status();
                if first_byte != GET_RESPONSE_REQ_ID {
                    return (vec![status], false);
                }
                match responder.peek_response() {
                    Some(mut frame) => {
                        frame[0] = status;
                        (frame, true)
                    }
                    None => (vec![status, STATUS_NO_RESPONSE, 0], false),
                }
            }
            None => panic!(
                "mock link: response queue empty on transfer {}; \
                 the test did not script enough responses",
                self.transfers + 1
            ),
        }
    }

    fn finish_transaction(&mut self) {
        let transaction = std::mem::take(&mut self.transaction);
        if transaction.from_responder && transaction.position > 1 {
            if let Some(responder) = self.responder.as_mut() {
                responder.consume_response();
            }
        }
        let written = transaction.written;
        if written.first().is_some_and(|&b| b != GET_RESPONSE_REQ_ID) {
            if let Some(responder) = self.responder.as_mut() {
                responder.request(&written);
            }
            self.requests.push(written);
        }
    }
}

impl LinkDriver for MockLink {
    fn init(&mut self) -> Result<(), LinkError> {
        self.state.borrow_mut().init_calls += 1;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), LinkError> {
        self.state.borrow_mut().deinit_calls += 1;
        Ok(())
    }

    fn transfer(&mut self, data: &mut [u8], _timeout: Duration) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        if !state.selected {
            return Err(LinkError::Transfer("transfer without chip select".to_string()));
        }
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }

        if state.transaction.response.is_none() {
            let first = data.first().copied().unwrap_or(0);
            let (response, from_responder) = state.start_response(first);
            state.transaction.response = Some(response);
            state.transaction.from_responder = from_responder;
        }

        let transfer = state.transfers + 1;
        let transaction = &mut state.transaction;
        let reading = transaction.written.first().or(data.first()) == Some(&GET_RESPONSE_REQ_ID);
        for byte in data.iter_mut() {
            transaction.written.push(*byte);
            let scripted = transaction
                .response
                .as_ref()
                .and_then(|r| r.get(transaction.position).copied());
            *byte = match scripted {
                Some(value) => value,
                None if transaction.scripted && reading => panic!(
                    "mock link: transfer {} read byte {} past the end of a {}-byte scripted response",
                    transfer,
                    transaction.position,
                    transaction.response.as_ref().map_or(0, Vec::len)
                ),
                None => 0,
            };
            transaction.position += 1;
        }
        state.transfers += 1;
        Ok(())
    }

    fn assert_select(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        state.selected = true;
        state.transaction = Transaction::default();
        Ok(())
    }

    fn deassert_select(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        if state.selected {
            state.finish_transaction();
        }
        state.selected = false;
        Ok(())
    }

    fn is_selected(&mut self) -> Result<bool, LinkError> {
        let state = self.state.borrow();
        Ok(state.select_stuck.unwrap_or(state.selected))
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        if !state.reset_supported {
            return Err(LinkError::Unsupported);
        }
        state.reset_events.push(asserted);
        Ok(())
    }

    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), LinkError> {
        self.state.borrow_mut().rng.fill_bytes(buf);
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.state.borrow_mut().delays.push(duration);
    }
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("MockLink")
            .field("pending", &state.queue.len())
            .field("transfers", &state.transfers)
            .field("selected", &state.selected)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Simulated chip
// ============================================================================

/// Result codes the simulated chip reports for command specific failures.
pub mod sim_result {
    /// User data slot already written.
    pub const R_MEM_DATA_WRITE_FAIL: u8 = 0x10;
    /// ECC slot holds no key.
    pub const ECC_INVALID_KEY: u8 = 0x12;
}

const ECC_ORIGIN_GENERATED: u8 = 0x01;
const CURVE_P256: u8 = 0x01;

struct ChipSession {
    command: [u8; KEY_LEN],
    result: [u8; KEY_LEN],
    command_counter: u32,
    result_counter: u32,
}

struct ChipState {
    crypto: RustCrypto,
    static_secret: [u8; X25519_KEY_LEN],
    static_public: [u8; X25519_KEY_LEN],
    pairing_keys: [Option<[u8; X25519_KEY_LEN]>; PAIRING_KEY_SLOTS as usize],
    certificate_store: Vec<u8>,
    chip_id: Vec<u8>,
    firmware_version: [u8; 4],
    firmware_valid: bool,
    in_startup: bool,
    alarm: bool,
    unresponsive: bool,
    session: Option<ChipSession>,
    incoming: Vec<u8>,
    outgoing: VecDeque<Vec<u8>>,
    last_response: Option<Vec<u8>>,
    r_mem: BTreeMap<u16, Vec<u8>>,
    ecc_keys: BTreeMap<u16, SigningKey>,
    rng: StdRng,
    tamper_next_result: bool,
    failing_commands: BTreeMap<u8, ResultCode>,
    commands_executed: usize,
}

/// Software model of the chip.
///
/// Plays the handshake responder and executes the L3 command set against an
/// in-memory key and data store. Clones share state.
#[derive(Clone)]
pub struct SimulatedChip {
    state: Rc<RefCell<ChipState>>,
}

impl SimulatedChip {
    /// Chip in application mode with keys drawn from `seed`.
    pub fn new(seed: u64) -> Self {
        let crypto = RustCrypto;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut static_secret = [0u8; X25519_KEY_LEN];
        rng.fill_bytes(&mut static_secret);
        let static_public = crypto.x25519_public(&static_secret);

        let certificate_store = CertificateStore::encode(&[
            device_certificate_with_key(&static_public),
            vec![0xA1; 180],
            vec![0xA2; 140],
            vec![0xA3; 96],
        ]);
        let mut chip_id = vec![0u8; GET_INFO_BLOCK_LEN];
        rng.fill_bytes(&mut chip_id);

        Self {
            state: Rc::new(RefCell::new(ChipState {
                crypto,
                static_secret,
                static_public,
                pairing_keys: [None; PAIRING_KEY_SLOTS as usize],
                certificate_store,
                chip_id,
                firmware_version: [0x00, 0x00, 0x02, 0x01],
                firmware_valid: true,
                in_startup: false,
                alarm: false,
                unresponsive: false,
                session: None,
                incoming: Vec::new(),
                outgoing: VecDeque::new(),
                last_response: None,
                r_mem: BTreeMap::new(),
                ecc_keys: BTreeMap::new(),
                rng,
                tamper_next_result: false,
                failing_commands: BTreeMap::new(),
                commands_executed: 0,
            })),
        }
    }

    /// Start in the bootloader, as after power-on.
    pub fn boot_in_startup(self) -> Self {
        self.state.borrow_mut().in_startup = true;
        self
    }

    /// Application firmware that never boots; reboots land in the bootloader.
    pub fn with_invalid_firmware(self) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.firmware_valid = false;
            state.in_startup = true;
        }
        self
    }

    /// Generate a host pairing key pair and install its public half in `slot`.
    ///
    /// Returns `(private, public)`.
    pub fn provision_pairing_key(
        &self,
        slot: PairingKeySlot,
    ) -> ([u8; X25519_KEY_LEN], [u8; X25519_KEY_LEN]) {
        let mut state = self.state.borrow_mut();
        let mut private = [0u8; X25519_KEY_LEN];
        state.rng.fill_bytes(&mut private);
        let public = state.crypto.x25519_public(&private);
        state.pairing_keys[slot.index() as usize] = Some(public);
        (private, public)
    }

    /// The chip's static X25519 public key.
    pub fn static_public(&self) -> [u8; X25519_KEY_LEN] {
        self.state.borrow().static_public
    }

    /// Raise or clear the alarm mode bit.
    pub fn set_alarm(&self, alarm: bool) {
        self.state.borrow_mut().alarm = alarm;
    }

    /// While set, the chip never delivers a response.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.borrow_mut().unresponsive = unresponsive;
    }

    /// Corrupt the authentication tag of the next encrypted result.
    pub fn tamper_next_result(&self) {
        self.state.borrow_mut().tamper_next_result = true;
    }

    /// Answer the next `command_id` with `code` instead of executing it.
    pub fn fail_next_command(&self, command_id: u8, code: ResultCode) {
        self.state.borrow_mut().failing_commands.insert(command_id, code);
    }

    /// Forget the session chip-side, as after a chip reset the host missed.
    pub fn drop_session(&self) {
        self.state.borrow_mut().session = None;
    }

    /// Whether the chip holds session keys.
    pub fn has_session(&self) -> bool {
        self.state.borrow().session.is_some()
    }

    /// Whether the chip sits in the bootloader.
    pub fn in_startup(&self) -> bool {
        self.state.borrow().in_startup
    }

    /// Contents of a user data slot.
    pub fn r_mem_slot(&self, slot: u16) -> Option<Vec<u8>> {
        self.state.borrow().r_mem.get(&slot).cloned()
    }

    /// Number of L3 commands decrypted and executed.
    pub fn commands_executed(&self) -> usize {
        self.state.borrow().commands_executed
    }
}

impl ChipState {
    fn status_byte(&self) -> u8 {
        let mut flags = ModeFlags::READY;
        if self.in_startup {
            flags |= ModeFlags::STARTUP;
        }
        if self.alarm {
            flags |= ModeFlags::ALARM;
        }
        flags
    }

    fn respond(&mut self, status: L2Status, data: &[u8]) {
        let frame = response_frame(self.status_byte(), status.as_byte(), data);
        self.outgoing.push_back(frame);
    }

    fn handle_request(&mut self, frame: &[u8]) {
        // A new request replaces any response the host never collected.
        self.outgoing.clear();
        if frame.len() < l2::REQUEST_HEADER_LEN + crc::CRC_LEN {
            self.respond(L2Status::GenericError, &[]);
            return;
        }
        let req_id = frame[0];
        let len = frame[1] as usize;
        let body_len = l2::REQUEST_HEADER_LEN + len;
        if frame.len() != body_len + crc::CRC_LEN
            || crc::crc16(&frame[..body_len])
                != crc::decode_trailer([frame[body_len], frame[body_len + 1]])
        {
            self.respond(L2Status::CrcError, &[]);
            return;
        }
        let payload = &frame[l2::REQUEST_HEADER_LEN..body_len];

        if self.in_startup && !matches!(req_id, l2::GET_INFO_REQ_ID | l2::STARTUP_REQ_ID) {
            self.respond(L2Status::RespDisabled, &[]);
            return;
        }

        match req_id {
            l2::GET_INFO_REQ_ID => self.get_info(payload),
            l2::HANDSHAKE_REQ_ID => self.handshake(payload),
            l2::ENCRYPTED_CMD_REQ_ID => self.encrypted_chunk(payload),
            l2::ENCRYPTED_SESSION_ABT_REQ_ID => {
                self.session = None;
                self.respond(L2Status::RequestOk, &[]);
            }
            l2::RESEND_REQ_ID => match self.last_response.clone() {
                Some(previous) => self.outgoing.push_back(previous),
                None => self.respond(L2Status::GenericError, &[]),
            },
            l2::SLEEP_REQ_ID => {
                self.session = None;
                self.respond(L2Status::RequestOk, &[]);
            }
            l2::STARTUP_REQ_ID => {
                self.session = None;
                self.incoming.clear();
                self.in_startup = match payload.first() {
                    Some(0x01) => !self.firmware_valid,
                    _ => true,
                };
                self.respond(L2Status::RequestOk, &[]);
            }
            _ => self.respond(L2Status::UnknownRequest, &[]),
        }
    }

    fn get_info(&mut self, payload: &[u8]) {
        let (object, block) = match payload {
            [object, block] => (*object, *block as usize),
            [object] => (*object, 0),
            _ => {
                self.respond(L2Status::GenericError, &[]);
                return;
            }
        };
        let data = match object {
            0x00 => {
                let start = block * GET_INFO_BLOCK_LEN;
                let end = (start + GET_INFO_BLOCK_LEN).min(self.certificate_store.len());
                self.certificate_store.get(start..end).map(<[u8]>::to_vec)
            }
            0x01 => Some(self.chip_id.clone()),
            0x02 | 0x04 => Some(self.firmware_version.to_vec()),
            _ => None,
        };
        match data {
            Some(data) => self.respond(L2Status::RequestOk, &data),
            None => self.respond(L2Status::GenericError, &[]),
        }
    }

    fn handshake(&mut self, payload: &[u8]) {
        self.session = None;
        if payload.len() != HANDSHAKE_REQUEST_LEN {
            self.respond(L2Status::GenericError, &[]);
            return;
        }
        let mut host_ephemeral = [0u8; X25519_KEY_LEN];
        host_ephemeral.copy_from_slice(&payload[..X25519_KEY_LEN]);
        let slot = payload[X25519_KEY_LEN];
        let host_static = match self.pairing_keys.get(slot as usize).copied().flatten() {
            Some(key) => key,
            None => {
                self.respond(L2Status::HandshakeError, &[]);
                return;
            }
        };

        let mut ephemeral_secret = [0u8; X25519_KEY_LEN];
        self.rng.fill_bytes(&mut ephemeral_secret);
        let ephemeral_public = self.crypto.x25519_public(&ephemeral_secret);

        let keys = match handshake::derive_responder(
            &self.crypto,
            &ephemeral_secret,
            &self.static_secret,
            &host_ephemeral,
            &host_static,
        ) {
            Ok(keys) => keys,
            Err(_) => {
                self.respond(L2Status::HandshakeError, &[]);
                return;
            }
        };
        let transcript = Transcript {
            host_static: &host_static,
            chip_static: &self.static_public,
            host_ephemeral: &host_ephemeral,
            slot,
            chip_ephemeral: &ephemeral_public,
        }
        .hash(&self.crypto);
        let tag = match handshake::auth_tag(&self.crypto, &keys.auth, &transcript) {
            Ok(tag) => tag,
            Err(_) => {
                self.respond(L2Status::HandshakeError, &[]);
                return;
            }
        };

        self.session = Some(ChipSession {
            command: *keys.command,
            result: *keys.result,
            command_counter: 0,
            result_counter: 0,
        });
        let mut response = Vec::with_capacity(X25519_KEY_LEN + TAG_LEN);
        response.extend_from_slice(&ephemeral_public);
        response.extend_from_slice(&tag);
        self.respond(L2Status::RequestOk, &response);
    }

    fn encrypted_chunk(&mut self, chunk: &[u8]) {
        self.incoming.extend_from_slice(chunk);
        if self.incoming.len() < L3_SIZE_LEN {
            self.respond(L2Status::RequestCont, &[]);
            return;
        }
        let size = u16::from_le_bytes([self.incoming[0], self.incoming[1]]) as usize;
        let total = L3_SIZE_LEN + size + TAG_LEN;
        if self.incoming.len() < total {
            self.respond(L2Status::RequestCont, &[]);
            return;
        }
        let packet = std::mem::take(&mut self.incoming);
        if packet.len() > total {
            self.respond(L2Status::GenericError, &[]);
            return;
        }
        self.encrypted_command(&packet[L3_SIZE_LEN..]);
    }

    fn encrypted_command(&mut self, sealed: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            self.respond(L2Status::NoSession, &[]);
            return;
        };
        let nonce = nonce_for(session.command_counter);
        let plaintext = match self.crypto.aead_open(&session.command, &nonce, &[], sealed) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.session = None;
                self.respond(L2Status::TagError, &[]);
                return;
            }
        };
        session.command_counter += 1;

        let result = self.execute(&plaintext);
        self.commands_executed += 1;

        let Some(session) = self.session.as_mut() else {
            self.respond(L2Status::NoSession, &[]);
            return;
        };
        let nonce = nonce_for(session.result_counter);
        let mut sealed = match self.crypto.aead_seal(&session.result, &nonce, &[], &result) {
            Ok(sealed) => sealed,
            Err(_) => {
                self.respond(L2Status::GenericError, &[]);
                return;
            }
        };
        session.result_counter += 1;
        if std::mem::take(&mut self.tamper_next_result) {
            if let Some(last) = sealed.last_mut() {
                *last ^= 0x01;
            }
        }

        let mut packet = Vec::with_capacity(L3_SIZE_LEN + sealed.len());
        packet.extend_from_slice(&(result.len() as u16).to_le_bytes());
        packet.extend_from_slice(&sealed);

        self.respond(L2Status::RequestOk, &[]);
        let count = packet.chunks(L2_CHUNK_MAX_DATA).count();
        for (index, chunk) in packet.chunks(L2_CHUNK_MAX_DATA).enumerate() {
            let status = if index + 1 == count {
                L2Status::ResultOk
            } else {
                L2Status::ResultCont
            };
            self.respond(status, chunk);
        }
    }

    fn execute(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let ok = ResultCode::Ok.as_byte();
        let Some((&id, data)) = plaintext.split_first() else {
            return vec![ResultCode::InvalidCommand.as_byte()];
        };
        if let Some(code) = self.failing_commands.remove(&id) {
            return vec![code.as_byte()];
        }
        let slot = || data.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]]));

        match (id, slot()) {
            (command::PING, _) => {
                let mut out = vec![ok];
                out.extend_from_slice(data);
                out
            }
            (command::RANDOM_VALUE_GET, _) => {
                let len = data.first().copied().unwrap_or(0) as usize;
                let mut out = vec![ok, 0, 0, 0];
                let mut random = vec![0u8; len];
                self.rng.fill_bytes(&mut random);
                out.extend_from_slice(&random);
                out
            }
            (command::R_MEM_DATA_WRITE, Some(slot)) if data.len() > 3 => {
                if self.r_mem.contains_key(&slot) {
                    return vec![sim_result::R_MEM_DATA_WRITE_FAIL];
                }
                self.r_mem.insert(slot, data[3..].to_vec());
                vec![ok]
            }
            (command::R_MEM_DATA_READ, Some(slot)) => {
                let mut out = vec![ok, 0, 0, 0];
                if let Some(stored) = self.r_mem.get(&slot) {
                    out.extend_from_slice(stored);
                }
                out
            }
            (command::R_MEM_DATA_ERASE, Some(slot)) => {
                self.r_mem.remove(&slot);
                vec![ok]
            }
            (command::ECC_KEY_GENERATE, Some(slot)) => {
                if data.get(2) != Some(&CURVE_P256) || self.ecc_keys.contains_key(&slot) {
                    return vec![ResultCode::Fail.as_byte()];
                }
                let key = SigningKey::random(&mut self.rng);
                self.ecc_keys.insert(slot, key);
                vec![ok]
            }
            (command::ECC_KEY_READ, Some(slot)) => match self.ecc_keys.get(&slot) {
                Some(key) => {
                    let point = VerifyingKey::from(key).to_encoded_point(false);
                    let mut out = vec![ok, CURVE_P256, ECC_ORIGIN_GENERATED];
                    out.extend_from_slice(&[0u8; 13]);
                    out.extend_from_slice(&point.as_bytes()[1..]);
                    out
                }
                None => vec![sim_result::ECC_INVALID_KEY],
            },
            (command::ECC_KEY_ERASE, Some(slot)) => {
                self.ecc_keys.remove(&slot);
                vec![ok]
            }
            (command::ECDSA_SIGN, Some(slot)) if data.len() == 2 + 13 + 32 => {
                let Some(key) = self.ecc_keys.get(&slot) else {
                    return vec![sim_result::ECC_INVALID_KEY];
                };
                let signature: Signature = match key.sign_prehash(&data[15..]) {
                    Ok(signature) => signature,
                    Err(_) => return vec![ResultCode::Fail.as_byte()],
                };
                let mut out = vec![ok];
                out.extend_from_slice(&[0u8; 15]);
                out.extend_from_slice(&signature.to_bytes());
                out
            }
            _ => vec![ResultCode::InvalidCommand.as_byte()],
        }
    }
}

impl Responder for SimulatedChip {
    fn status(&mut self) -> u8 {
        self.state.borrow().status_byte()
    }

    fn peek_response(&mut self) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        if state.unresponsive {
            return None;
        }
        state.outgoing.front().cloned()
    }

    fn consume_response(&mut self) {
        let mut state = self.state.borrow_mut();
        let frame = state.outgoing.pop_front();
        if frame.is_some() {
            state.last_response = frame;
        }
    }

    fn request(&mut self, frame: &[u8]) {
        self.state.borrow_mut().handle_request(frame);
    }
}

impl std::fmt::Debug for SimulatedChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("SimulatedChip")
            .field("in_startup", &state.in_startup)
            .field("session", &state.session.is_some())
            .field("queued_responses", &state.outgoing.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(link: &mut MockLink) {
        link.assert_select().unwrap();
    }

    #[test]
    fn test_response_frame_crc_covers_status_onward() {
        let frame = response_frame(ModeFlags::READY, 0x01, &[]);
        assert_eq!(frame, vec![0x01, 0x01, 0x00, 0x03, 0x86]);
    }

    #[test]
    fn test_transaction_reads_are_cumulative() {
        let mut link = MockLink::new();
        link.enqueue_response(vec![1, 2, 3, 4]);
        select(&mut link);

        let mut first = [0xAA];
        link.transfer(&mut first, Duration::ZERO).unwrap();
        let mut rest = [0u8; 3];
        link.transfer(&mut rest, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();

        assert_eq!(first, [1]);
        assert_eq!(rest, [2, 3, 4]);
        assert!(link.requests().is_empty());
    }

    #[test]
    fn test_written_requests_are_recorded() {
        let mut link = MockLink::new();
        link.enqueue_write_ack();
        select(&mut link);
        let mut frame = [0x20, 0x01, 0x05, 0x00, 0x00];
        link.transfer(&mut frame, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();

        assert_eq!(link.requests(), vec![vec![0x20, 0x01, 0x05, 0x00, 0x00]]);
        assert_eq!(frame[0], ModeFlags::READY);
    }

    #[test]
    fn test_transfer_without_select_fails() {
        let mut link = MockLink::new();
        let mut data = [0u8; 1];
        assert!(matches!(
            link.transfer(&mut data, Duration::ZERO),
            Err(LinkError::Transfer(_))
        ));
    }

    #[test]
    #[should_panic(expected = "response queue empty")]
    fn test_empty_queue_panics() {
        let mut link = MockLink::new();
        select(&mut link);
        let mut data = [0xAA];
        let _ = link.transfer(&mut data, Duration::ZERO);
    }

    #[test]
    #[should_panic(expected = "past the end of a 1-byte scripted response")]
    fn test_reading_past_scripted_response_panics() {
        let link = MockLink::new();
        link.enqueue_write_ack();
        let mut t = crate::l1::Transport::new(link.clone(), Default::default());
        let mut buf = crate::buffer::FrameBuffer::new();
        let _ = t.read_frame(&mut buf);
    }

    #[test]
    fn test_write_past_scripted_ack_reads_zero() {
        let mut link = MockLink::new();
        link.enqueue_write_ack();
        select(&mut link);
        let mut frame = [0x01, 0x02, 0x03];
        link.transfer(&mut frame, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();

        assert_eq!(frame, [ModeFlags::READY, 0, 0]);
    }

    #[test]
    fn test_reply_sees_requests_and_queues_followups() {
        let mut link = MockLink::new();
        link.enqueue_write_ack();
        link.enqueue_reply(|ctx| {
            let id = ctx.last_request().map(|r| r[0]).unwrap_or(0);
            vec![vec![id], vec![0x77]]
        });

        select(&mut link);
        let mut frame = [0x10, 0x00, 0x00, 0x00];
        link.transfer(&mut frame, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();

        for expected in [0x10, 0x77] {
            select(&mut link);
            let mut byte = [0xAA];
            link.transfer(&mut byte, Duration::ZERO).unwrap();
            link.deassert_select().unwrap();
            assert_eq!(byte, [expected]);
        }
        assert_eq!(link.pending(), 0);
    }

    #[test]
    fn test_random_bytes_are_seeded() {
        let mut a = MockLink::with_seed(9);
        let mut b = MockLink::with_seed(9);
        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        a.random_bytes(&mut x).unwrap();
        b.random_bytes(&mut y).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_chip_mode_poll_does_not_consume_response() {
        let chip = SimulatedChip::new(1);
        let mut link = MockLink::with_chip(&chip);

        // Get_Info chip id.
        let mut request = vec![0x01, 0x02, 0x01, 0x00];
        let trailer = crc::trailer(&request);
        request.extend_from_slice(&trailer);
        select(&mut link);
        link.transfer(&mut request, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();

        select(&mut link);
        let mut status = [0xAA];
        link.transfer(&mut status, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();
        assert_eq!(status, [ModeFlags::READY]);

        select(&mut link);
        let mut header = [0xAA, 0, 0, 0];
        link.transfer(&mut header, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();
        assert_eq!(header[1], 0x01);
        assert_eq!(header[2] as usize, GET_INFO_BLOCK_LEN);
    }

    #[test]
    fn test_chip_rejects_bad_request_crc() {
        let chip = SimulatedChip::new(2);
        let mut link = MockLink::with_chip(&chip);
        let mut request = vec![0x01, 0x02, 0x01, 0x00, 0xDE, 0xAD];

        select(&mut link);
        link.transfer(&mut request, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();

        select(&mut link);
        let mut header = [0xAA, 0, 0];
        link.transfer(&mut header, Duration::ZERO).unwrap();
        link.deassert_select().unwrap();
        assert_eq!(header[1], L2Status::CrcError.as_byte());
    }
}
