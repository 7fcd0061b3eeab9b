//! Commands describing the SMTP envelope: who connected, from where, to whom

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::buf::BufExt;
use crate::wire::{Parsable, Writable};
use crate::{Malformed, ProtocolError, Truncated};

/// Transport family of the connection the MTA accepted
#[allow(missing_docs)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Family {
    Unknown = b'U',
    Unix = b'L',
    Inet = b'4',
    Inet6 = b'6',
}

/// Where the SMTP client connected from
#[derive(Clone, PartialEq, Debug)]
pub struct Connect {
    hostname: BytesMut,
    /// The transport family of the client connection
    pub family: Family,
    /// The client port, for IP families
    pub port: Option<u16>,
    address: BytesMut,
}

impl Connect {
    const CODE: u8 = b'C';

    /// Describe a client connection
    #[must_use]
    pub fn new(hostname: &[u8], family: Family, port: Option<u16>, address: &[u8]) -> Self {
        Self {
            hostname: BytesMut::from(hostname),
            family,
            port,
            address: BytesMut::from(address),
        }
    }

    /// The resolved client hostname
    #[must_use]
    pub fn hostname(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.hostname)
    }

    /// The client address; an IP or a unix socket path
    #[must_use]
    pub fn address(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.address)
    }
}

impl Parsable for Connect {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(hostname) = buffer.take_until(0) else {
            return Err(Malformed::new("connect hostname not nul terminated", buffer).into());
        };

        let Some(family) = buffer.take_u8() else {
            return Err(Truncated::new("connect family", 1, 0).into());
        };
        let family = Family::try_from(family).map_err(|_| {
            Malformed::new(
                "connect family byte unrecognized",
                BytesMut::from_iter(&[family]),
            )
        })?;

        let port = match family {
            Family::Inet | Family::Inet6 => {
                let Some(port) = buffer.take_u16() else {
                    return Err(Truncated::new("connect port", 2, buffer.len()).into());
                };
                Some(port)
            }
            _ => None,
        };

        let address = match buffer.last() {
            Some(0) => buffer.split_to(buffer.len() - 1),
            _ => buffer,
        };

        Ok(Self {
            hostname,
            family,
            port,
            address,
        })
    }
}

impl Writable for Connect {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.hostname);
        buffer.put_u8(0);
        buffer.put_u8(self.family.into());
        buffer.put_u16(self.port.unwrap_or_default());
        buffer.extend_from_slice(&self.address);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.hostname.len() + 1 + 1 + 2 + self.address.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        false
    }
}

/// The HELO/EHLO name the SMTP client announced
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Helo {
    fqdn: BytesMut,
}

impl From<&[u8]> for Helo {
    fn from(value: &[u8]) -> Self {
        Self {
            fqdn: BytesMut::from(value),
        }
    }
}

impl Helo {
    const CODE: u8 = b'H';

    /// The announced name
    #[must_use]
    pub fn fqdn(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.fqdn)
    }
}

impl Parsable for Helo {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(fqdn) = buffer.take_until(0) else {
            return Err(Malformed::new("helo name not nul terminated", buffer).into());
        };

        Ok(Self { fqdn })
    }
}

impl Writable for Helo {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.fqdn);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        self.fqdn.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        self.fqdn.is_empty()
    }
}

/// The envelope sender, plus any ESMTP arguments the client gave
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Mail {
    sender: BytesMut,
    esmtp_args: Option<BytesMut>,
}

impl From<&[u8]> for Mail {
    fn from(value: &[u8]) -> Self {
        Self {
            sender: BytesMut::from(value),
            esmtp_args: None,
        }
    }
}

impl Mail {
    const CODE: u8 = b'M';

    /// The envelope sender address
    #[must_use]
    pub fn sender(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.sender)
    }

    /// ESMTP arguments attached to MAIL FROM, empty if none
    #[must_use]
    pub fn esmtp_args(&self) -> Vec<Cow<str>> {
        split_args(self.esmtp_args.as_ref())
    }
}

impl Parsable for Mail {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(sender) = buffer.take_until(0) else {
            return Err(Malformed::new("mail sender not nul terminated", buffer).into());
        };

        Ok(Self {
            sender,
            esmtp_args: remaining_args(buffer),
        })
    }
}

impl Writable for Mail {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.sender);
        buffer.put_u8(0);
        if let Some(args) = &self.esmtp_args {
            buffer.extend_from_slice(args);
        }
    }

    fn len(&self) -> usize {
        self.sender.len() + 1 + self.esmtp_args.as_ref().map_or(0, BytesMut::len)
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        false
    }
}

/// One envelope recipient, plus any ESMTP arguments the client gave
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Recipient {
    recipient: BytesMut,
    esmtp_args: Option<BytesMut>,
}

impl From<&[u8]> for Recipient {
    fn from(value: &[u8]) -> Self {
        Self {
            recipient: BytesMut::from(value),
            esmtp_args: None,
        }
    }
}

impl Recipient {
    const CODE: u8 = b'R';

    /// The recipient address
    #[must_use]
    pub fn recipient(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.recipient)
    }

    /// ESMTP arguments attached to RCPT TO, empty if none
    #[must_use]
    pub fn esmtp_args(&self) -> Vec<Cow<str>> {
        split_args(self.esmtp_args.as_ref())
    }
}

impl Parsable for Recipient {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(recipient) = buffer.take_until(0) else {
            return Err(Malformed::new("recipient not nul terminated", buffer).into());
        };

        Ok(Self {
            recipient,
            esmtp_args: remaining_args(buffer),
        })
    }
}

impl Writable for Recipient {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(&self.recipient);
        buffer.put_u8(0);
        if let Some(args) = &self.esmtp_args {
            buffer.extend_from_slice(args);
        }
    }

    fn len(&self) -> usize {
        self.recipient.len() + 1 + self.esmtp_args.as_ref().map_or(0, BytesMut::len)
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        false
    }
}

fn remaining_args(buffer: BytesMut) -> Option<BytesMut> {
    if buffer.is_empty() {
        None
    } else {
        Some(buffer)
    }
}

fn split_args(args: Option<&BytesMut>) -> Vec<Cow<str>> {
    let Some(args) = args else {
        return Vec::new();
    };

    args[..]
        .split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(String::from_utf8_lossy)
        .collect()
}
