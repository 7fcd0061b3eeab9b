//! Bounds-checked slicing helpers on top of [`bytes::BytesMut`]

use std::mem::size_of;

use bytes::{Buf, BytesMut};

/// Consuming reads from a [`BytesMut`] that return `None` instead of
/// panicking when the buffer is too short.
pub trait BufExt {
    /// Split off everything up to (excluding) the next `delimiter` byte.
    ///
    /// The delimiter itself is consumed but not returned. `None` if the
    /// buffer holds no such byte.
    fn take_until(&mut self, delimiter: u8) -> Option<BytesMut>;

    /// Split off the first `count` bytes, if present.
    fn take(&mut self, count: usize) -> Option<BytesMut>;

    /// Consume a single byte.
    fn take_u8(&mut self) -> Option<u8>;

    /// Consume a big-endian `u16`.
    fn take_u16(&mut self) -> Option<u16>;

    /// Consume a big-endian `u32`.
    fn take_u32(&mut self) -> Option<u32>;
}

impl BufExt for BytesMut {
    fn take_until(&mut self, delimiter: u8) -> Option<BytesMut> {
        let at = self.iter().position(|&b| b == delimiter)?;
        let head = self.split_to(at);
        self.advance(1);
        Some(head)
    }

    fn take(&mut self, count: usize) -> Option<BytesMut> {
        if count > self.len() {
            return None;
        }
        Some(self.split_to(count))
    }

    fn take_u8(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        Some(self.get_u8())
    }

    fn take_u16(&mut self) -> Option<u16> {
        if self.len() < size_of::<u16>() {
            return None;
        }
        Some(self.get_u16())
    }

    fn take_u32(&mut self) -> Option<u32> {
        if self.len() < size_of::<u32>() {
            return None;
        }
        Some(self.get_u32())
    }
}
