//! Envelope modifications: recipients and the sender address

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};

use crate::buf::BufExt;
use crate::wire::{Parsable, Writable};
use crate::{Malformed, ProtocolError};

/// Deliver the message to one more recipient
#[derive(Debug, Clone)]
pub struct AddRecipient {
    recipient: BytesMut,
}

impl AddRecipient {
    const CODE: u8 = b'+';

    /// Add `recipient` to the envelope
    #[must_use]
    pub fn new(recipient: &[u8]) -> Self {
        Self {
            recipient: BytesMut::from(recipient),
        }
    }

    /// The recipient to add
    #[must_use]
    pub fn recipient(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.recipient)
    }
}

impl Parsable for AddRecipient {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(recipient) = buffer.take_until(0) else {
            return Err(Malformed::new("add recipient not nul terminated", buffer).into());
        };

        Ok(Self { recipient })
    }
}

impl Writable for AddRecipient {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.recipient);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.recipient.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.recipient.is_empty()
    }
}

/// Deliver to one more recipient, passing ESMTP arguments along
#[derive(Debug, Clone)]
pub struct AddRecipientPar {
    recipient: BytesMut,
    esmtp_args: BytesMut,
}

impl AddRecipientPar {
    const CODE: u8 = b'2';

    /// Add `recipient` with the given ESMTP argument string
    #[must_use]
    pub fn new(recipient: &[u8], esmtp_args: &[u8]) -> Self {
        Self {
            recipient: BytesMut::from(recipient),
            esmtp_args: BytesMut::from(esmtp_args),
        }
    }

    /// The recipient to add
    #[must_use]
    pub fn recipient(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.recipient)
    }

    /// The ESMTP arguments for the RCPT command
    #[must_use]
    pub fn esmtp_args(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.esmtp_args)
    }
}

impl Parsable for AddRecipientPar {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(recipient) = buffer.take_until(0) else {
            return Err(Malformed::new("add recipient not nul terminated", buffer).into());
        };
        let esmtp_args = match buffer.take_until(0) {
            Some(args) => args,
            None => buffer,
        };

        Ok(Self {
            recipient,
            esmtp_args,
        })
    }
}

impl Writable for AddRecipientPar {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.recipient);
        buffer.put_u8(0);
        buffer.extend_from_slice(&self.esmtp_args);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.recipient.len() + 1 + self.esmtp_args.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.recipient.is_empty()
    }
}

/// Strike a recipient from the envelope
#[derive(Debug, Clone)]
pub struct DeleteRecipient {
    recipient: BytesMut,
}

impl DeleteRecipient {
    const CODE: u8 = b'-';

    /// Remove exactly `recipient` from the envelope
    #[must_use]
    pub fn new(recipient: &[u8]) -> Self {
        Self {
            recipient: BytesMut::from(recipient),
        }
    }

    /// The recipient to remove
    #[must_use]
    pub fn recipient(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.recipient)
    }
}

impl Parsable for DeleteRecipient {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(recipient) = buffer.take_until(0) else {
            return Err(Malformed::new("delete recipient not nul terminated", buffer).into());
        };

        Ok(Self { recipient })
    }
}

impl Writable for DeleteRecipient {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.recipient);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.recipient.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.recipient.is_empty()
    }
}

/// Replace the envelope sender, optionally with ESMTP arguments
#[derive(Debug, Clone)]
pub struct ChangeFrom {
    sender: BytesMut,
    esmtp_args: Option<BytesMut>,
}

impl ChangeFrom {
    const CODE: u8 = b'e';

    /// Make `sender` the new envelope sender
    #[must_use]
    pub fn new(sender: &[u8], esmtp_args: Option<&[u8]>) -> Self {
        Self {
            sender: BytesMut::from(sender),
            esmtp_args: esmtp_args.map(BytesMut::from),
        }
    }

    /// The new envelope sender
    #[must_use]
    pub fn sender(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.sender)
    }

    /// ESMTP arguments for the MAIL command, if any
    #[must_use]
    pub fn esmtp_args(&self) -> Option<Cow<str>> {
        self.esmtp_args
            .as_ref()
            .map(|args| String::from_utf8_lossy(args))
    }
}

impl Parsable for ChangeFrom {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(sender) = buffer.take_until(0) else {
            return Err(Malformed::new("change from not nul terminated", buffer).into());
        };
        let esmtp_args = match buffer.take_until(0) {
            Some(args) if !args.is_empty() => Some(args),
            _ => None,
        };

        Ok(Self { sender, esmtp_args })
    }
}

impl Writable for ChangeFrom {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.sender);
        buffer.put_u8(0);
        if let Some(args) = &self.esmtp_args {
            buffer.extend_from_slice(args);
            buffer.put_u8(0);
        }
    }

    fn len(&self) -> usize {
        self.sender.len() + 1 + self.esmtp_args.as_ref().map_or(0, |args| args.len() + 1)
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn add_recipient_wire_shape() {
        let mut buffer = BytesMut::new();
        AddRecipient::new(b"<copy@example>").write(&mut buffer);

        assert_eq!(buffer, BytesMut::from("<copy@example>\0"));
    }

    #[test]
    fn add_recipient_par_roundtrip() {
        let add = AddRecipientPar::new(b"<copy@example>", b"NOTIFY=NEVER");

        let mut buffer = BytesMut::new();
        add.write(&mut buffer);
        assert_eq!(add.len(), buffer.len());

        let parsed = AddRecipientPar::parse(buffer).expect("own bytes parse");
        assert_eq!(parsed.recipient(), "<copy@example>");
        assert_eq!(parsed.esmtp_args(), "NOTIFY=NEVER");
    }

    #[test]
    fn change_from_without_args() {
        let change = ChangeFrom::new(b"<bounce@example>", None);

        let mut buffer = BytesMut::new();
        change.write(&mut buffer);
        assert_eq!(buffer, BytesMut::from("<bounce@example>\0"));

        let parsed = ChangeFrom::parse(buffer).expect("own bytes parse");
        assert_eq!(parsed.sender(), "<bounce@example>");
        assert_eq!(parsed.esmtp_args(), None);
    }

    #[test]
    fn delete_recipient_requires_terminator() {
        DeleteRecipient::parse(BytesMut::from("dangling")).expect_err("missing nul");
    }
}
