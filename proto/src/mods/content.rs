//! Content-level modifications: replacing the body, quarantining the message

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};

use crate::wire::{Parsable, Writable};
use crate::ProtocolError;

/// One chunk of a replacement body.
///
/// A filter replacing the body must replace it entirely; the replacement may
/// span several of these frames, but their concatenation is the whole new
/// body.
#[derive(Debug, Clone)]
pub struct ReplaceBody {
    chunk: BytesMut,
}

impl ReplaceBody {
    const CODE: u8 = b'b';

    /// A replacement body chunk
    #[must_use]
    pub fn new(chunk: &[u8]) -> Self {
        Self {
            chunk: BytesMut::from(chunk),
        }
    }

    /// The raw replacement bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.chunk
    }
}

impl Parsable for ReplaceBody {
    const CODE: u8 = Self::CODE;

    fn parse(buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self { chunk: buffer })
    }
}

impl Writable for ReplaceBody {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.chunk);
    }

    fn len(&self) -> usize {
        self.chunk.len()
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }
}

/// Hold the message in the MTA's quarantine area instead of delivering it
#[derive(Debug, Clone)]
pub struct Quarantine {
    reason: BytesMut,
}

impl Quarantine {
    const CODE: u8 = b'q';

    /// Quarantine, explaining why
    #[must_use]
    pub fn new(reason: &[u8]) -> Self {
        Self {
            reason: BytesMut::from(reason),
        }
    }

    /// The reason given for the quarantine
    #[must_use]
    pub fn reason(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.reason)
    }
}

impl Parsable for Quarantine {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let reason = match buffer.last() {
            Some(0) => buffer.split_to(buffer.len() - 1),
            _ => buffer,
        };

        Ok(Self { reason })
    }
}

impl Writable for Quarantine {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.reason);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.reason.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.reason.is_empty()
    }
}
