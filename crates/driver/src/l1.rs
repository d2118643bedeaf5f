//! L1 link transport: select bracketing, raw transfers, response polling.
//!
//! # Response Read
//!
//! The chip cannot push data. To collect a response the host, inside one
//! chip-select window:
//! - clocks out `0xAA` and reads back the chip status byte
//! - if the READY bit is set, reads the L2 status and length bytes
//! - if the L2 status is "no response yet", releases select and polls again
//! - otherwise reads `length + 2` more bytes (payload and CRC)
//!
//! A chip that is busy (READY clear) is also polled again after the retry
//! delay. The ALARM bit ends the poll immediately.

use std::fmt;
use std::time::Duration;

use crate::buffer::FrameBuffer;
use crate::config::{PollTracker, TransportConfig};
use crate::crc::CRC_LEN;
use crate::error::{Error, Result};
use crate::link::{LinkDriver, LinkError};

/// Request id that asks the chip to clock out its pending response.
pub const GET_RESPONSE_REQ_ID: u8 = 0xAA;

/// Largest payload carried by one L2 frame.
pub const L2_CHUNK_MAX_DATA: usize = 252;

/// Chip status + L2 status + length + payload + CRC.
pub const L1_LEN_MAX: usize = 1 + 1 + 1 + L2_CHUNK_MAX_DATA + CRC_LEN;

/// L2 status byte meaning the chip has nothing to send yet.
pub(crate) const STATUS_NO_RESPONSE: u8 = 0xFF;

/// Chip lifecycle mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipMode {
    /// Not yet polled, or the chip was busy when last polled.
    Unknown,
    /// Bootloader mode; only startup and info requests are served.
    Startup,
    /// Application mode.
    Ready,
    /// The chip detected a fault and stopped serving requests.
    Alarm,
}

impl fmt::Display for ChipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipMode::Unknown => "unknown",
            ChipMode::Startup => "startup",
            ChipMode::Ready => "ready",
            ChipMode::Alarm => "alarm",
        };
        f.write_str(name)
    }
}

/// Mode bits of the chip status byte, as named facets.
///
/// The bits are independent of whether a response is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFlags {
    /// The chip can accept a request or deliver a response.
    pub ready: bool,
    /// The chip is in alarm mode.
    pub alarm: bool,
    /// The chip is running its bootloader.
    pub startup: bool,
}

impl ModeFlags {
    /// READY bit.
    pub const READY: u8 = 0x01;
    /// ALARM bit.
    pub const ALARM: u8 = 0x02;
    /// STARTUP bit.
    pub const STARTUP: u8 = 0x04;

    /// Decode a raw chip status byte.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self {
            ready: byte & Self::READY != 0,
            alarm: byte & Self::ALARM != 0,
            startup: byte & Self::STARTUP != 0,
        }
    }

    /// Encode back into a raw chip status byte.
    #[inline]
    pub fn as_byte(self) -> u8 {
        let mut byte = 0;
        if self.ready {
            byte |= Self::READY;
        }
        if self.alarm {
            byte |= Self::ALARM;
        }
        if self.startup {
            byte |= Self::STARTUP;
        }
        byte
    }

    /// Lifecycle mode implied by the bits. Alarm wins over startup, startup
    /// over ready; no bit set reads as [`ChipMode::Unknown`].
    pub fn mode(self) -> ChipMode {
        if self.alarm {
            ChipMode::Alarm
        } else if self.startup {
            ChipMode::Startup
        } else if self.ready {
            ChipMode::Ready
        } else {
            ChipMode::Unknown
        }
    }
}

enum Poll {
    Busy,
    Pending,
    Frame(usize),
}

/// Link transport bound to one link driver.
pub struct Transport<L: LinkDriver> {
    link: L,
    config: TransportConfig,
    observed: Option<ModeFlags>,
}

impl<L: LinkDriver> Transport<L> {
    /// Wrap a link driver.
    pub fn new(link: L, config: TransportConfig) -> Self {
        Self {
            link,
            config,
            observed: None,
        }
    }

    /// The underlying link driver.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The underlying link driver, mutably.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Active configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Mode bits from the most recent status byte read off the chip.
    pub fn last_observed(&self) -> Option<ModeFlags> {
        self.observed
    }

    /// Clear the recorded mode bits.
    pub fn forget_observed(&mut self) {
        self.observed = None;
    }

    /// Clock out `len` bytes of `buf` starting at `offset`, overwriting them
    /// with the bytes read back.
    pub fn transfer(
        &mut self,
        buf: &mut FrameBuffer,
        offset: usize,
        len: usize,
        timeout: Duration,
    ) -> Result<()> {
        let window = buf.window_mut(offset, len)?;
        self.link.transfer(window, timeout)?;
        Ok(())
    }

    /// Run `f` inside one chip-select window.
    ///
    /// Select is always released, even when `f` fails; the error from `f`
    /// takes precedence over a release failure.
    pub fn exchange<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.select()?;
        let outcome = f(self);
        let released = self.deselect();
        let value = outcome?;
        released?;
        Ok(value)
    }

    fn select(&mut self) -> Result<()> {
        self.link.assert_select()?;
        if let Err(err) = self.verify_select(true) {
            let _ = self.link.deassert_select();
            return Err(err);
        }
        Ok(())
    }

    fn deselect(&mut self) -> Result<()> {
        self.link.deassert_select()?;
        self.verify_select(false)
    }

    fn verify_select(&mut self, expected: bool) -> Result<()> {
        for _ in 0..self.config.select_check_attempts.max(1) {
            if self.link.is_selected()? == expected {
                return Ok(());
            }
        }
        Err(LinkError::SelectLine { expected }.into())
    }

    /// Read the chip status byte without collecting a response.
    pub fn read_chip_status(&mut self, buf: &mut FrameBuffer) -> Result<ModeFlags> {
        let timeout = self.config.transfer_timeout();
        self.exchange(|t| {
            buf.window_mut(0, 1)?[0] = GET_RESPONSE_REQ_ID;
            t.transfer(buf, 0, 1, timeout)?;
            let flags = ModeFlags::from_byte(buf.as_slice()[0]);
            t.observed = Some(flags);
            Ok(flags)
        })
    }

    /// Send the first `len` bytes of `buf` as one request frame.
    pub fn write_frame(&mut self, buf: &mut FrameBuffer, len: usize) -> Result<()> {
        let timeout = self.config.transfer_timeout();
        tracing::trace!(len, "l1 write");
        self.exchange(|t| t.transfer(buf, 0, len, timeout))
    }

    /// Poll until the chip delivers a response frame into `buf`.
    ///
    /// Returns the number of frame bytes now in `buf`, starting with the chip
    /// status byte.
    pub fn read_frame(&mut self, buf: &mut FrameBuffer) -> Result<usize> {
        let timeout = self.config.transfer_timeout();
        let delay = self.config.poll_delay();
        let mut tracker = PollTracker::new(self.config.poll_budget);

        while !tracker.exhausted() {
            tracker.record_attempt();
            let poll = self.exchange(|t| {
                buf.window_mut(0, 1)?[0] = GET_RESPONSE_REQ_ID;
                t.transfer(buf, 0, 1, timeout)?;
                let flags = ModeFlags::from_byte(buf.as_slice()[0]);
                t.observed = Some(flags);
                if flags.alarm {
                    return Err(Error::NotReady(ChipMode::Alarm));
                }
                if !flags.ready {
                    return Ok(Poll::Busy);
                }

                t.transfer(buf, 1, 2, timeout)?;
                let header = buf.window(1, 2)?;
                if header[0] == STATUS_NO_RESPONSE {
                    return Ok(Poll::Pending);
                }
                let len = header[1] as usize;
                if len > L2_CHUNK_MAX_DATA {
                    return Err(Error::MalformedFrame(format!(
                        "length field {} exceeds {}",
                        len, L2_CHUNK_MAX_DATA
                    )));
                }
                t.transfer(buf, 3, len + CRC_LEN, timeout)?;
                Ok(Poll::Frame(3 + len + CRC_LEN))
            })?;

            match poll {
                Poll::Frame(len) => {
                    tracing::trace!(len, attempts = tracker.attempts(), "l1 read");
                    return Ok(len);
                }
                Poll::Busy | Poll::Pending => {
                    tracing::trace!(attempt = tracker.attempts(), "chip has no response yet");
                    self.link.delay(delay);
                    tracker.record_wait(delay);
                }
            }
        }

        Err(Error::Timeout {
            attempts: tracker.attempts(),
        })
    }

    /// Pulse the reset line.
    ///
    /// Reports [`LinkError::Unsupported`] when the driver has no reset line.
    pub fn hardware_reset(&mut self) -> Result<()> {
        self.link.set_reset(true)?;
        let pulse = self.config.reset_pulse();
        self.link.delay(pulse);
        self.link.set_reset(false)?;
        let settle = self.config.reset_settle();
        self.link.delay(settle);
        Ok(())
    }

    /// Block for `duration` through the link driver.
    pub fn delay(&mut self, duration: Duration) {
        self.link.delay(duration);
    }

    /// Fill `out` from the host random source.
    pub fn random_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        self.link.random_bytes(out)?;
        Ok(())
    }
}
