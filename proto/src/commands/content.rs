//! Commands carrying the message content: headers, body chunks and the
//! markers between them

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};

use crate::buf::BufExt;
use crate::wire::{Parsable, Writable};
use crate::{Malformed, ProtocolError};

/// The SMTP DATA command was issued; headers and body follow
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Data;

impl Data {
    const CODE: u8 = b'T';
}

impl Parsable for Data {
    const CODE: u8 = Self::CODE;

    fn parse(_buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

impl Writable for Data {
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

/// A single message header.
///
/// Names repeat; the same header may arrive many times.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Header {
    name: BytesMut,
    value: BytesMut,
}

impl Header {
    const CODE: u8 = b'L';

    /// A header `name: value` pair
    #[must_use]
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Self {
            name: BytesMut::from(name),
            value: BytesMut::from(value),
        }
    }

    /// The header name
    #[must_use]
    pub fn name(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.name)
    }

    /// The header value
    #[must_use]
    pub fn value(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.value)
    }
}

impl Parsable for Header {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(name) = buffer.take_until(0) else {
            return Err(Malformed::new("header name not nul terminated", buffer).into());
        };
        let Some(value) = buffer.take_until(0) else {
            return Err(Malformed::new("header value not nul terminated", buffer).into());
        };

        Ok(Self { name, value })
    }
}

impl Writable for Header {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.name);
        buffer.put_u8(0);
        buffer.extend_from_slice(&self.value);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.name.len() + 1 + self.value.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.name.is_empty() && self.value.is_empty()
    }
}

/// All headers have been sent
#[derive(Clone, PartialEq, Debug, Default)]
pub struct EndOfHeader;

impl EndOfHeader {
    const CODE: u8 = b'N';
}

impl Parsable for EndOfHeader {
    const CODE: u8 = Self::CODE;

    fn parse(_buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

impl Writable for EndOfHeader {
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

/// One chunk of the message body, at most 64 KiB on the wire
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Body {
    chunk: BytesMut,
}

impl From<&[u8]> for Body {
    fn from(value: &[u8]) -> Self {
        Self {
            chunk: BytesMut::from(value),
        }
    }
}

impl Body {
    const CODE: u8 = b'B';

    /// The raw chunk bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.chunk
    }
}

impl Parsable for Body {
    const CODE: u8 = Self::CODE;

    fn parse(buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self { chunk: buffer })
    }
}

impl Writable for Body {
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

/// The body is complete.
///
/// May carry one final chunk that did not warrant its own body frame. This
/// is the only stage a filter may answer with modifications.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct EndOfMessage {
    chunk: BytesMut,
}

impl From<&[u8]> for EndOfMessage {
    fn from(value: &[u8]) -> Self {
        Self {
            chunk: BytesMut::from(value),
        }
    }
}

impl EndOfMessage {
    const CODE: u8 = b'E';

    /// The trailing body bytes, often empty
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.chunk
    }
}

impl Parsable for EndOfMessage {
    const CODE: u8 = Self::CODE;

    fn parse(buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self { chunk: buffer })
    }
}

impl Writable for EndOfMessage {
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

/// An SMTP command the MTA itself did not recognize
#[derive(Clone, PartialEq, Debug)]
pub struct Unknown {
    data: BytesMut,
}

impl From<&[u8]> for Unknown {
    fn from(value: &[u8]) -> Self {
        Self {
            data: BytesMut::from(value),
        }
    }
}

impl Unknown {
    const CODE: u8 = b'U';

    /// The verbatim command line
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Parsable for Unknown {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let data = match buffer.take_until(0) {
            Some(data) => data,
            None => buffer,
        };

        Ok(Self { data })
    }
}

impl Writable for Unknown {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.data);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.data.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
