//! L2 frame protocol: request/response framing with a CRC trailer.
//!
//! # Frame Format
//!
//! Request, host to chip:
//! - 1 byte: request id
//! - 1 byte: payload length
//! - N bytes: payload (at most 252)
//! - 2 bytes: CRC-16 over id, length and payload
//!
//! Response, chip to host:
//! - 1 byte: chip status (mode bits)
//! - 1 byte: L2 status
//! - 1 byte: payload length
//! - N bytes: payload
//! - 2 bytes: CRC-16 over status, length and payload
//!
//! Encrypted L3 packets longer than one frame travel as a run of
//! `ENCRYPTED_CMD` frames; the chip acknowledges intermediate chunks with
//! `REQUEST_CONT` and returns result chunks as `RESULT_CONT` until the final
//! `RESULT_OK`.

use std::fmt;

use crate::buffer::FrameBuffer;
use crate::crc::{self, CRC_LEN};
use crate::error::{Error, Result};
use crate::l1::{ModeFlags, Transport, L2_CHUNK_MAX_DATA};
use crate::link::LinkDriver;

/// Read a block of a Get_Info object.
pub const GET_INFO_REQ_ID: u8 = 0x01;
/// Start a secure session.
pub const HANDSHAKE_REQ_ID: u8 = 0x02;
/// Carry one chunk of an encrypted L3 command.
pub const ENCRYPTED_CMD_REQ_ID: u8 = 0x04;
/// Abort the secure session.
pub const ENCRYPTED_SESSION_ABT_REQ_ID: u8 = 0x08;
/// Ask the chip to send the last response again.
pub const RESEND_REQ_ID: u8 = 0x10;
/// Put the chip to sleep.
pub const SLEEP_REQ_ID: u8 = 0x20;
/// Reboot the chip.
pub const STARTUP_REQ_ID: u8 = 0xB3;

/// Request header: id + length.
pub const REQUEST_HEADER_LEN: usize = 2;
/// Response header: chip status + L2 status + length.
pub const RESPONSE_HEADER_LEN: usize = 3;

/// L2 status byte of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Status {
    /// Request accepted.
    RequestOk,
    /// Result delivered.
    ResultOk,
    /// Intermediate request chunk accepted.
    RequestCont,
    /// More result chunks follow.
    ResultCont,
    /// The request type is disabled on this chip.
    RespDisabled,
    /// Handshake rejected.
    HandshakeError,
    /// No secure session is open on the chip.
    NoSession,
    /// The chip failed to authenticate an encrypted command.
    TagError,
    /// The chip saw a CRC mismatch.
    CrcError,
    /// The request id is unknown.
    UnknownRequest,
    /// Unspecified chip failure.
    GenericError,
    /// Nothing to send yet.
    NoResponse,
    /// Status byte not defined by this protocol revision.
    Unrecognized(u8),
}

impl L2Status {
    /// Decode a raw status byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => L2Status::RequestOk,
            0x02 => L2Status::ResultOk,
            0x03 => L2Status::RequestCont,
            0x04 => L2Status::ResultCont,
            0x78 => L2Status::RespDisabled,
            0x79 => L2Status::HandshakeError,
            0x7A => L2Status::NoSession,
            0x7B => L2Status::TagError,
            0x7C => L2Status::CrcError,
            0x7E => L2Status::UnknownRequest,
            0x7F => L2Status::GenericError,
            0xFF => L2Status::NoResponse,
            other => L2Status::Unrecognized(other),
        }
    }

    /// Raw status byte.
    pub fn as_byte(self) -> u8 {
        match self {
            L2Status::RequestOk => 0x01,
            L2Status::ResultOk => 0x02,
            L2Status::RequestCont => 0x03,
            L2Status::ResultCont => 0x04,
            L2Status::RespDisabled => 0x78,
            L2Status::HandshakeError => 0x79,
            L2Status::NoSession => 0x7A,
            L2Status::TagError => 0x7B,
            L2Status::CrcError => 0x7C,
            L2Status::UnknownRequest => 0x7E,
            L2Status::GenericError => 0x7F,
            L2Status::NoResponse => 0xFF,
            L2Status::Unrecognized(byte) => byte,
        }
    }

    /// Readiness facet of the status.
    pub fn readiness(self) -> Readiness {
        match self {
            L2Status::NoResponse => Readiness::NoResponseYet,
            L2Status::RequestOk
            | L2Status::ResultOk
            | L2Status::RequestCont
            | L2Status::ResultCont => Readiness::RequestOk,
            L2Status::CrcError => Readiness::CrcError,
            L2Status::GenericError => Readiness::GenericError,
            _ => Readiness::RequestError,
        }
    }
}

impl fmt::Display for L2Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            L2Status::RequestOk => "request ok",
            L2Status::ResultOk => "result ok",
            L2Status::RequestCont => "request continue",
            L2Status::ResultCont => "result continue",
            L2Status::RespDisabled => "response disabled",
            L2Status::HandshakeError => "handshake error",
            L2Status::NoSession => "no session",
            L2Status::TagError => "tag error",
            L2Status::CrcError => "crc error",
            L2Status::UnknownRequest => "unknown request",
            L2Status::GenericError => "generic error",
            L2Status::NoResponse => "no response",
            L2Status::Unrecognized(_) => "unrecognized status",
        };
        write!(f, "{} ({:#04x})", name, self.as_byte())
    }
}

/// Whether a response is available, and if so whether the request succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Poll again.
    NoResponseYet,
    /// The request was accepted.
    RequestOk,
    /// The chip rejected the request.
    RequestError,
    /// The chip received a corrupted request.
    CrcError,
    /// The chip failed for an unspecified reason.
    GenericError,
}

/// Decoded chip status: mode bits and readiness, read independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipStatus {
    /// Mode bits.
    pub mode: ModeFlags,
    /// Response readiness.
    pub readiness: Readiness,
}

/// A request about to be framed.
#[derive(Debug, Clone, Copy)]
pub struct RequestFrame<'a> {
    /// Request id.
    pub req_id: u8,
    /// Payload, at most [`L2_CHUNK_MAX_DATA`] bytes.
    pub payload: &'a [u8],
}

impl<'a> RequestFrame<'a> {
    /// Create a request frame.
    pub fn new(req_id: u8, payload: &'a [u8]) -> Self {
        Self { req_id, payload }
    }

    /// Encode into the front of `buf`, returning the frame length.
    ///
    /// Fails with [`Error::PayloadTooLarge`] without touching `buf`.
    pub fn encode_into(&self, buf: &mut FrameBuffer) -> Result<usize> {
        let len = self.payload.len();
        if len > L2_CHUNK_MAX_DATA {
            return Err(Error::PayloadTooLarge {
                size: len,
                max: L2_CHUNK_MAX_DATA,
            });
        }

        let body_len = REQUEST_HEADER_LEN + len;
        let frame = buf.window_mut(0, body_len + CRC_LEN)?;
        frame[0] = self.req_id;
        frame[1] = len as u8;
        frame[REQUEST_HEADER_LEN..body_len].copy_from_slice(self.payload);
        let trailer = crc::trailer(&frame[..body_len]);
        frame[body_len..].copy_from_slice(&trailer);
        Ok(body_len + CRC_LEN)
    }
}

/// A validated response frame borrowed from the frame buffer.
#[derive(Debug, Clone, Copy)]
pub struct Response<'a> {
    /// Mode bits reported alongside the response.
    pub chip: ModeFlags,
    /// L2 status.
    pub status: L2Status,
    /// Payload bytes; only ever exposed after the CRC check passed.
    pub payload: &'a [u8],
}

impl Response<'_> {
    /// Both facets of the chip status.
    pub fn chip_status(&self) -> ChipStatus {
        ChipStatus {
            mode: self.chip,
            readiness: self.status.readiness(),
        }
    }
}

/// Validate the response frame occupying the first `len` bytes of `buf`.
pub fn decode_response(buf: &FrameBuffer, len: usize) -> Result<Response<'_>> {
    if len < RESPONSE_HEADER_LEN + CRC_LEN {
        return Err(Error::MalformedFrame(format!("frame of {} bytes is too short", len)));
    }
    let frame = buf.window(0, len)?;
    let payload_len = frame[2] as usize;
    if RESPONSE_HEADER_LEN + payload_len + CRC_LEN != len {
        return Err(Error::MalformedFrame(format!(
            "length field {} does not match frame of {} bytes",
            payload_len, len
        )));
    }

    let crc_start = RESPONSE_HEADER_LEN + payload_len;
    let expected = crc::crc16(&frame[1..crc_start]);
    let got = crc::decode_trailer([frame[crc_start], frame[crc_start + 1]]);
    if expected != got {
        return Err(Error::Integrity { expected, got });
    }

    Ok(Response {
        chip: ModeFlags::from_byte(frame[0]),
        status: L2Status::from_byte(frame[1]),
        payload: &frame[RESPONSE_HEADER_LEN..crc_start],
    })
}

/// Frame `payload` under `req_id` and send it.
pub fn send_request<L: LinkDriver>(
    transport: &mut Transport<L>,
    buf: &mut FrameBuffer,
    req_id: u8,
    payload: &[u8],
) -> Result<()> {
    let len = RequestFrame::new(req_id, payload).encode_into(buf)?;
    tracing::trace!(req_id, len = payload.len(), "l2 send");
    transport.write_frame(buf, len)
}

/// Poll for, validate and classify the next response frame.
///
/// Error statuses come back as distinct error kinds: `CRC_ERR` as
/// [`Error::ChipCrc`], `GEN_ERR` as [`Error::ChipGeneric`], everything else as
/// [`Error::RequestRejected`] carrying the status.
pub fn receive_response<'b, L: LinkDriver>(
    transport: &mut Transport<L>,
    buf: &'b mut FrameBuffer,
) -> Result<Response<'b>> {
    let len = transport.read_frame(buf)?;
    let buf: &'b FrameBuffer = buf;
    let response = decode_response(buf, len)?;
    tracing::trace!(status = %response.status, len = response.payload.len(), "l2 receive");

    match response.status.readiness() {
        Readiness::RequestOk => Ok(response),
        Readiness::CrcError => Err(Error::ChipCrc),
        Readiness::GenericError => Err(Error::ChipGeneric),
        Readiness::RequestError | Readiness::NoResponseYet => {
            Err(Error::RequestRejected(response.status))
        }
    }
}

/// Send one request and receive its response.
pub fn transceive<'b, L: LinkDriver>(
    transport: &mut Transport<L>,
    buf: &'b mut FrameBuffer,
    req_id: u8,
    payload: &[u8],
) -> Result<Response<'b>> {
    send_request(transport, buf, req_id, payload)?;
    receive_response(transport, buf)
}

/// Ask the chip to repeat its last response.
pub fn request_resend<'b, L: LinkDriver>(
    transport: &mut Transport<L>,
    buf: &'b mut FrameBuffer,
) -> Result<Response<'b>> {
    transceive(transport, buf, RESEND_REQ_ID, &[])
}

/// Send an encrypted L3 packet as a run of `ENCRYPTED_CMD` frames.
pub fn send_encrypted<L: LinkDriver>(
    transport: &mut Transport<L>,
    buf: &mut FrameBuffer,
    packet: &[u8],
) -> Result<()> {
    let count = packet.chunks(L2_CHUNK_MAX_DATA).count();
    for (index, chunk) in packet.chunks(L2_CHUNK_MAX_DATA).enumerate() {
        let expected = if index + 1 == count {
            L2Status::RequestOk
        } else {
            L2Status::RequestCont
        };
        let response = transceive(transport, buf, ENCRYPTED_CMD_REQ_ID, chunk)?;
        if response.status != expected {
            return Err(Error::UnexpectedResponse(format!(
                "chunk {} of {} acknowledged with {}",
                index + 1,
                count,
                response.status
            )));
        }
    }
    Ok(())
}

/// Collect an encrypted L3 response delivered as `RESULT_CONT` chunks closed by
/// `RESULT_OK`, appending it to `out`.
pub fn receive_encrypted<L: LinkDriver>(
    transport: &mut Transport<L>,
    buf: &mut FrameBuffer,
    out: &mut Vec<u8>,
    max_len: usize,
) -> Result<()> {
    loop {
        let response = receive_response(transport, buf)?;
        if out.len() + response.payload.len() > max_len {
            return Err(Error::PayloadTooLarge {
                size: out.len() + response.payload.len(),
                max: max_len,
            });
        }
        out.extend_from_slice(response.payload);
        match response.status {
            L2Status::ResultCont => continue,
            L2Status::ResultOk => return Ok(()),
            other => {
                return Err(Error::UnexpectedResponse(format!(
                    "encrypted result chunk carried {}",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PollBudget, TransportConfig};
    use crate::mock::{response_frame, MockLink};

    fn transport(link: &MockLink) -> Transport<MockLink> {
        let config = TransportConfig {
            poll_budget: PollBudget::Attempts(2),
            ..TransportConfig::default()
        };
        Transport::new(link.clone(), config)
    }

    #[test]
    fn test_status_byte_roundtrip() {
        for byte in [0x01, 0x02, 0x03, 0x04, 0x78, 0x79, 0x7A, 0x7B, 0x7C, 0x7E, 0x7F, 0xFF, 0x55] {
            assert_eq!(L2Status::from_byte(byte).as_byte(), byte);
        }
    }

    #[test]
    fn test_readiness_classification() {
        assert_eq!(L2Status::NoResponse.readiness(), Readiness::NoResponseYet);
        assert_eq!(L2Status::ResultCont.readiness(), Readiness::RequestOk);
        assert_eq!(L2Status::CrcError.readiness(), Readiness::CrcError);
        assert_eq!(L2Status::GenericError.readiness(), Readiness::GenericError);
        assert_eq!(L2Status::HandshakeError.readiness(), Readiness::RequestError);
        assert_eq!(L2Status::Unrecognized(0x42).readiness(), Readiness::RequestError);
    }

    #[test]
    fn test_encode_request_layout() {
        let mut buf = FrameBuffer::new();
        let len = RequestFrame::new(GET_INFO_REQ_ID, &[0x00, 0x01])
            .encode_into(&mut buf)
            .unwrap();
        assert_eq!(len, 6);
        let frame = buf.window(0, len).unwrap();
        assert_eq!(&frame[..4], &[0x01, 0x02, 0x00, 0x01]);
        assert_eq!(&frame[4..], &crc::trailer(&[0x01, 0x02, 0x00, 0x01]));
    }

    #[test]
    fn test_round_trip_identity() {
        let link = MockLink::new();
        let payload: Vec<u8> = (0u8..40).collect();
        link.enqueue_write_ack();
        link.enqueue_response(response_frame(ModeFlags::READY, 0x02, &payload));
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();

        let response = transceive(&mut t, &mut buf, GET_INFO_REQ_ID, &[0x01, 0x00]).unwrap();

        assert_eq!(response.status, L2Status::ResultOk);
        assert_eq!(response.payload, payload.as_slice());
        assert!(response.chip.ready);
    }

    #[test]
    fn test_request_bytes_reach_link() {
        let link = MockLink::new();
        link.enqueue_write_ack();
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();

        send_request(&mut t, &mut buf, SLEEP_REQ_ID, &[0x05]).unwrap();

        let requests = link.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(&requests[0][..3], &[SLEEP_REQ_ID, 0x01, 0x05]);
        assert_eq!(requests[0].len(), 5);
    }

    #[test]
    fn test_corrupted_trailer_is_integrity_error() {
        let link = MockLink::new();
        let mut frame = response_frame(ModeFlags::READY, 0x02, &[0x11, 0x22, 0x33]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        link.enqueue_response(frame);
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();

        let err = receive_response(&mut t, &mut buf).unwrap_err();

        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[test]
    fn test_corrupted_payload_is_integrity_error() {
        let link = MockLink::new();
        let mut frame = response_frame(ModeFlags::READY, 0x02, &[0x11, 0x22, 0x33]);
        frame[4] ^= 0x01;
        link.enqueue_response(frame);
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();

        assert!(matches!(
            receive_response(&mut t, &mut buf),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn test_error_statuses_stay_distinct() {
        let cases = [
            (0x7C, "crc"),
            (0x7F, "generic"),
            (0x7E, "rejected"),
            (0x79, "rejected"),
        ];
        for (status, kind) in cases {
            let link = MockLink::new();
            link.enqueue_response(response_frame(ModeFlags::READY, status, &[]));
            let mut t = transport(&link);
            let mut buf = FrameBuffer::new();
            let err = receive_response(&mut t, &mut buf).unwrap_err();
            match kind {
                "crc" => assert!(matches!(err, Error::ChipCrc)),
                "generic" => assert!(matches!(err, Error::ChipGeneric)),
                _ => assert!(
                    matches!(err, Error::RequestRejected(s) if s.as_byte() == status),
                    "status {:#04x} mapped to {:?}",
                    status,
                    err
                ),
            }
        }
    }

    #[test]
    fn test_payload_size_limits() {
        for size in [0usize, L2_CHUNK_MAX_DATA] {
            let link = MockLink::new();
            let payload = vec![0x5A; size];
            link.enqueue_write_ack();
            link.enqueue_response(response_frame(ModeFlags::READY, 0x01, &payload));
            let mut t = transport(&link);
            let mut buf = FrameBuffer::new();

            let response = transceive(&mut t, &mut buf, GET_INFO_REQ_ID, &payload).unwrap();
            assert_eq!(response.payload.len(), size);
        }

        let link = MockLink::new();
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();
        let err = send_request(&mut t, &mut buf, GET_INFO_REQ_ID, &[0u8; 253]).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { size: 253, max: 252 }));
        assert_eq!(link.transfer_count(), 0);
    }

    #[test]
    fn test_resend_returns_repeated_response() {
        let link = MockLink::new();
        link.enqueue_write_ack();
        link.enqueue_response(response_frame(ModeFlags::READY, 0x02, &[0x09]));
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();

        let response = request_resend(&mut t, &mut buf).unwrap();

        assert_eq!(response.payload, &[0x09]);
        assert_eq!(link.requests()[0][0], RESEND_REQ_ID);
    }

    #[test]
    fn test_send_encrypted_chunks() {
        let link = MockLink::new();
        let packet = vec![0xC0; 300];
        link.enqueue_write_ack();
        link.enqueue_response(response_frame(ModeFlags::READY, 0x03, &[]));
        link.enqueue_write_ack();
        link.enqueue_response(response_frame(ModeFlags::READY, 0x01, &[]));
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();

        send_encrypted(&mut t, &mut buf, &packet).unwrap();

        let requests = link.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0][1] as usize, 252);
        assert_eq!(requests[1][1] as usize, 48);
    }

    #[test]
    fn test_send_encrypted_premature_ok_rejected() {
        let link = MockLink::new();
        link.enqueue_write_ack();
        link.enqueue_response(response_frame(ModeFlags::READY, 0x01, &[]));
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();

        let err = send_encrypted(&mut t, &mut buf, &[0u8; 260]).unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse(_)));
    }

    #[test]
    fn test_receive_encrypted_reassembles_chunks() {
        let link = MockLink::new();
        link.enqueue_response(response_frame(ModeFlags::READY, 0x04, &[1u8; 252]));
        link.enqueue_response(response_frame(ModeFlags::READY, 0x02, &[2u8; 10]));
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();
        let mut out = Vec::new();

        receive_encrypted(&mut t, &mut buf, &mut out, 1024).unwrap();

        assert_eq!(out.len(), 262);
        assert_eq!(out[251], 1);
        assert_eq!(out[252], 2);
    }

    #[test]
    fn test_receive_encrypted_enforces_limit() {
        let link = MockLink::new();
        link.enqueue_response(response_frame(ModeFlags::READY, 0x04, &[1u8; 200]));
        let mut t = transport(&link);
        let mut buf = FrameBuffer::new();
        let mut out = Vec::new();

        let err = receive_encrypted(&mut t, &mut buf, &mut out, 100).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }
}
