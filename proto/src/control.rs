//! Session control frames: aborting a message and closing a connection

use bytes::BytesMut;
use enum_dispatch::enum_dispatch;

use crate::wire::{Parsable, Writable};
use crate::ProtocolError;

/// The control frames an MTA may send outside the SMTP stage flow
#[allow(missing_docs)]
#[enum_dispatch]
#[derive(Debug, Clone, strum::Display)]
pub enum Control {
    Abort,
    Quit,
    QuitNc,
}

/// Drop the current message, keep the connection.
///
/// Sent by an MTA when the SMTP transaction it mirrors was cut short. The
/// next message may follow on the same connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Abort;

impl Abort {
    const CODE: u8 = b'A';
}

impl Parsable for Abort {
    const CODE: u8 = Self::CODE;

    fn parse(_buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

impl Writable for Abort {
    fn write(&self, _buffer: &mut BytesMut) {}

    fn len(&self) -> usize {
        0
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        true
    }
}

/// Close this milter connection for good
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quit;

impl Quit {
    const CODE: u8 = b'Q';
}

impl Parsable for Quit {
    const CODE: u8 = Self::CODE;

    fn parse(_buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

impl Writable for Quit {
    fn write(&self, _buffer: &mut BytesMut) {}

    fn len(&self) -> usize {
        0
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        true
    }
}

/// Finish the current message but keep the connection for the next one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuitNc;

impl QuitNc {
    const CODE: u8 = b'K';
}

impl Parsable for QuitNc {
    const CODE: u8 = Self::CODE;

    fn parse(_buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

impl Writable for QuitNc {
    fn write(&self, _buffer: &mut BytesMut) {}

    fn len(&self) -> usize {
        0
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        true
    }
}
