use std::io;

use bytes::BytesMut;
use thiserror::Error;

/// Anything that can go wrong turning bytes into frames or back
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload did not follow the shape its code promised
    #[error(transparent)]
    Malformed(#[from] Malformed),
    /// The payload ended before the item was complete
    #[error(transparent)]
    Truncated(#[from] Truncated),
    /// A frame longer than the agreed maximum
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    /// Passed through from the transport below the codec
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Payload bytes that contradict the milter grammar
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct Malformed {
    /// What rule the payload broke
    pub msg: &'static str,
    /// The bytes that broke it
    pub bytes: BytesMut,
}

impl Malformed {
    /// Record `bytes` as violating `msg`
    #[must_use]
    pub fn new(msg: &'static str, bytes: BytesMut) -> Self {
        Self { msg, bytes }
    }
}

/// A payload that ran out before the item it encodes was complete
#[derive(Debug, Error)]
#[error("truncated {item}: wanted {expected} more byte(s), {got} left")]
pub struct Truncated {
    /// The item being parsed when the bytes ran out
    pub item: &'static str,
    /// How many bytes the item still needed
    pub expected: usize,
    /// How many bytes were left
    pub got: usize,
}

impl Truncated {
    /// Record `item` as cut short
    #[must_use]
    pub fn new(item: &'static str, expected: usize, got: usize) -> Self {
        Self {
            item,
            expected,
            got,
        }
    }
}
