//! Error types for the driver crate.

use thiserror::Error;

use crate::l1::ChipMode;
use crate::l2::L2Status;
use crate::l3::ResultCode;
use crate::link::LinkError;
use crate::session::SessionState;

/// Driver error type covering every failure a device operation can report.
#[derive(Debug, Error)]
pub enum Error {
    // Link errors
    /// The external link driver reported a fault.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// A transfer window does not fit inside the frame buffer.
    #[error("transfer out of bounds: offset {offset} + length {length} exceeds buffer capacity {capacity}")]
    Length {
        /// First byte of the window.
        offset: usize,
        /// Window length.
        length: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// The polling budget ran out before the chip produced a response.
    #[error("timed out waiting for chip response after {attempts} polls")]
    Timeout {
        /// Number of status polls issued.
        attempts: u32,
    },

    // Frame errors
    /// The response trailer did not match the CRC computed by the host.
    #[error("response integrity check failed: expected crc {expected:#06x}, got {got:#06x}")]
    Integrity {
        /// CRC computed over the received bytes.
        expected: u16,
        /// CRC carried by the frame.
        got: u16,
    },

    /// The response frame is structurally invalid.
    #[error("malformed response frame: {0}")]
    MalformedFrame(String),

    /// The chip reported a CRC mismatch on the request it received.
    #[error("chip reported crc error on request")]
    ChipCrc,

    /// The chip reported a generic failure.
    #[error("chip reported generic error")]
    ChipGeneric,

    /// The chip rejected the request with a specific status.
    #[error("chip rejected request: {0}")]
    RequestRejected(L2Status),

    /// The payload does not fit in one frame.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Payload size requested.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },

    /// A command argument is outside the range the chip accepts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Chip mode
    /// The chip is not in a mode that accepts the operation.
    #[error("chip not ready: mode is {0}")]
    NotReady(ChipMode),

    // Session errors
    /// The handshake was rejected or failed verification.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The session was torn down after a protocol or decryption failure.
    #[error("secure session fault: {0}")]
    SessionFault(String),

    /// A secure command was issued without an active session.
    #[error("no active secure session (state: {0})")]
    NoSession(SessionState),

    /// The session outlived its time-to-live.
    #[error("secure session expired")]
    SessionExpired,

    // Command errors
    /// The chip executed the command and returned a failure result.
    #[error("command failed with result {0}")]
    CommandFailed(ResultCode),

    /// The chip returned a response that does not fit the command.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The crypto provider failed.
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true when the error tears down the secure session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::SessionFault(_) | Error::SessionExpired | Error::AuthenticationFailed(_)
        )
    }
}
