//! Boundary to the host-supplied link driver.
//!
//! The driver stack never touches a bus directly. Everything it needs from the
//! host (byte transfer, chip select, reset line, randomness, sleeping) goes
//! through [`LinkDriver`], so any SPI controller or test double that honours
//! the contract can be plugged in.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a link driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Driver initialisation or teardown failed.
    #[error("link initialisation failed: {0}")]
    Init(String),

    /// The byte transfer itself failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The chip select line did not reach the requested level.
    #[error("chip select line stuck (expected asserted = {expected})")]
    SelectLine {
        /// The level that was requested.
        expected: bool,
    },

    /// The driver does not provide this capability.
    #[error("operation not supported by link driver")]
    Unsupported,

    /// The random source failed.
    #[error("random source failed: {0}")]
    Rng(String),
}

/// Host adaptation layer for one physical chip connection.
///
/// Transfers are full duplex at the byte level: the bytes in `data` are
/// clocked out and replaced in place by the bytes clocked in.
pub trait LinkDriver {
    /// Prepare the bus. Called by `Device::init`.
    fn init(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    /// Release the bus. Called by `Device::deinit`.
    fn deinit(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    /// Clock `data` out and overwrite it with the bytes clocked in.
    fn transfer(&mut self, data: &mut [u8], timeout: Duration) -> Result<(), LinkError>;

    /// Drive chip select active.
    fn assert_select(&mut self) -> Result<(), LinkError>;

    /// Drive chip select inactive.
    fn deassert_select(&mut self) -> Result<(), LinkError>;

    /// Read back the chip select line level (true = asserted).
    fn is_selected(&mut self) -> Result<bool, LinkError>;

    /// Drive the reset line. Drivers without a reset line keep the default.
    fn set_reset(&mut self, asserted: bool) -> Result<(), LinkError> {
        let _ = asserted;
        Err(LinkError::Unsupported)
    }

    /// Fill `buf` from the host random source.
    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<(), LinkError>;

    /// Block the calling thread.
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
