//! The single transfer buffer owned by a device handle.
//!
//! One buffer is reused for every frame. L1 and L2 borrow it mutably for the
//! duration of an exchange; nothing else holds a reference in between.

use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::l1::L1_LEN_MAX;

/// Capacity of the frame buffer: the largest L1 frame.
pub const FRAME_BUFFER_CAPACITY: usize = L1_LEN_MAX;

/// Bounded byte buffer shared by L1 and L2.
pub struct FrameBuffer {
    bytes: [u8; FRAME_BUFFER_CAPACITY],
}

impl FrameBuffer {
    /// Create a zeroed buffer.
    pub fn new() -> Self {
        Self {
            bytes: [0u8; FRAME_BUFFER_CAPACITY],
        }
    }

    /// Total capacity in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        FRAME_BUFFER_CAPACITY
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn window(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = Self::checked_end(offset, len)?;
        Ok(&self.bytes[offset..end])
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    pub fn window_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = Self::checked_end(offset, len)?;
        Ok(&mut self.bytes[offset..end])
    }

    /// The whole buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Overwrite the buffer with zeros.
    pub fn clear(&mut self) {
        self.bytes.zeroize();
    }

    fn checked_end(offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= FRAME_BUFFER_CAPACITY => Ok(end),
            _ => Err(Error::Length {
                offset,
                length: len,
                capacity: FRAME_BUFFER_CAPACITY,
            }),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &FRAME_BUFFER_CAPACITY)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_matches_largest_frame() {
        let buf = FrameBuffer::new();
        assert_eq!(buf.capacity(), 257);
        assert_eq!(buf.as_slice().len(), 257);
    }

    #[test]
    fn test_window_within_bounds() {
        let mut buf = FrameBuffer::new();
        buf.window_mut(3, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.window(3, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(buf.window(0, 257).unwrap().len(), 257);
    }

    #[test]
    fn test_window_out_of_bounds() {
        let buf = FrameBuffer::new();
        let err = buf.window(200, 58).unwrap_err();
        assert!(matches!(
            err,
            Error::Length {
                offset: 200,
                length: 58,
                capacity: 257
            }
        ));
    }

    #[test]
    fn test_window_overflowing_offset() {
        let mut buf = FrameBuffer::new();
        assert!(matches!(
            buf.window_mut(usize::MAX, 2),
            Err(Error::Length { .. })
        ));
    }

    #[test]
    fn test_clear_zeroes_contents() {
        let mut buf = FrameBuffer::new();
        buf.window_mut(0, 8).unwrap().fill(0xEE);
        buf.clear();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }
}
