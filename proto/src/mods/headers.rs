//! Header modifications: add at the end, insert at a position, change in place

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};

use crate::buf::BufExt;
use crate::commands::Header;
use crate::wire::{Parsable, Writable};
use crate::{ProtocolError, Truncated};

/// Append a header after all existing ones
#[derive(Debug, Clone)]
pub struct AddHeader {
    header: Header,
}

impl AddHeader {
    const CODE: u8 = b'h';

    /// Append `name: value`
    #[must_use]
    pub fn new(name: &[u8], value: &[u8]) -> Self {
        Self {
            header: Header::new(name, value),
        }
    }

    /// The header name
    #[must_use]
    pub fn name(&self) -> Cow<str> {
        self.header.name()
    }

    /// The header value
    #[must_use]
    pub fn value(&self) -> Cow<str> {
        self.header.value()
    }
}

impl Parsable for AddHeader {
    const CODE: u8 = Self::CODE;

    fn parse(buffer: BytesMut) -> Result<Self, ProtocolError> {
        Ok(Self {
            header: Header::parse(buffer)?,
        })
    }
}

impl Writable for AddHeader {
    fn write(&self, buffer: &mut BytesMut) {
        self.header.write(buffer);
    }

    fn len(&self) -> usize {
        self.header.len()
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.header.is_empty()
    }
}

/// Insert a header at a position in the header list
#[derive(Debug, Clone)]
pub struct InsertHeader {
    index: u32,
    header: Header,
}

impl InsertHeader {
    const CODE: u8 = b'i';

    /// Insert `name: value` so it becomes the `index`-th header (1-based)
    #[must_use]
    pub fn new(index: u32, name: &[u8], value: &[u8]) -> Self {
        Self {
            index,
            header: Header::new(name, value),
        }
    }

    /// The target position, 1-based
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The header name
    #[must_use]
    pub fn name(&self) -> Cow<str> {
        self.header.name()
    }

    /// The header value
    #[must_use]
    pub fn value(&self) -> Cow<str> {
        self.header.value()
    }
}

impl Parsable for InsertHeader {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(index) = buffer.take_u32() else {
            return Err(Truncated::new("insert header index", 4, buffer.len()).into());
        };

        Ok(Self {
            index,
            header: Header::parse(buffer)?,
        })
    }
}

impl Writable for InsertHeader {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.put_u32(self.index);
        self.header.write(buffer);
    }

    fn len(&self) -> usize {
        4 + self.header.len()
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.header.is_empty()
    }
}

/// Change the nth header of a given name.
///
/// The index counts only headers sharing `name` and is 1-based. An empty
/// value deletes that header occurrence.
#[derive(Debug, Clone)]
pub struct ChangeHeader {
    index: u32,
    header: Header,
}

impl ChangeHeader {
    const CODE: u8 = b'm';

    /// Replace the value of the `index`-th header called `name`
    #[must_use]
    pub fn new(index: u32, name: &[u8], value: &[u8]) -> Self {
        Self {
            index,
            header: Header::new(name, value),
        }
    }

    /// Which occurrence of [`Self::name`] to change, 1-based
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The header name
    #[must_use]
    pub fn name(&self) -> Cow<str> {
        self.header.name()
    }

    /// The new value; empty means delete the occurrence
    #[must_use]
    pub fn value(&self) -> Cow<str> {
        self.header.value()
    }
}

impl Parsable for ChangeHeader {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(index) = buffer.take_u32() else {
            return Err(Truncated::new("change header index", 4, buffer.len()).into());
        };

        Ok(Self {
            index,
            header: Header::parse(buffer)?,
        })
    }
}

impl Writable for ChangeHeader {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.put_u32(self.index);
        self.header.write(buffer);
    }

    fn len(&self) -> usize {
        4 + self.header.len()
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.header.is_empty()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn add_header_wire_shape() {
        let mut buffer = BytesMut::new();
        AddHeader::new(b"X-Scanned", b"yes").write(&mut buffer);

        assert_eq!(buffer, BytesMut::from("X-Scanned\0yes\0"));
    }

    #[rstest]
    #[case(ChangeHeader::new(1, b"Subject", b"new"), BytesMut::from("\0\0\0\x01Subject\0new\0"))]
    #[case(ChangeHeader::new(2, b"Received", b""), BytesMut::from("\0\0\0\x02Received\0\0"))]
    fn change_header_wire_shape(#[case] change: ChangeHeader, #[case] expected: BytesMut) {
        let mut buffer = BytesMut::new();
        change.write(&mut buffer);

        assert_eq!(buffer, expected);
        assert_eq!(change.len(), expected.len());
    }

    #[test]
    fn insert_header_roundtrip() {
        let insert = InsertHeader::new(3, b"X-Note", b"inserted");

        let mut buffer = BytesMut::new();
        insert.write(&mut buffer);

        let parsed = InsertHeader::parse(buffer).expect("own bytes parse");
        assert_eq!(parsed.index(), 3);
        assert_eq!(parsed.name(), "X-Note");
        assert_eq!(parsed.value(), "inserted");
    }

    #[test]
    fn change_header_index_required() {
        let err = ChangeHeader::parse(BytesMut::from("ab")).expect_err("index missing");
        assert!(matches!(err, ProtocolError::Truncated(_)));
    }
}
