//! Flow verdicts a filter hands back for the stage it was just shown

use std::borrow::Cow;

use bytes::{BufMut, BytesMut};
use enum_dispatch::enum_dispatch;

use crate::buf::BufExt;
use crate::wire::{Parsable, Writable};
use crate::{Malformed, ProtocolError};

/// All flow verdicts combined
#[allow(missing_docs)]
#[enum_dispatch]
#[derive(Debug, Clone, strum::Display)]
pub enum Reply {
    Continue,
    Accept,
    Reject,
    TemporaryFailure,
    Discard,
    Skip,
    Progress,
    Replycode,
}

macro_rules! plain_reply {
    (
        $(#[$outer:meta])*
        $name:ident = $code:literal
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $name;

        impl $name {
            const CODE: u8 = $code;
        }

        impl Parsable for $name {
            const CODE: u8 = Self::CODE;

            fn parse(_buffer: BytesMut) -> Result<Self, ProtocolError> {
                Ok(Self)
            }
        }

        impl Writable for $name {
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
    };
}

plain_reply!(
    /// Proceed to the next step of the protocol
    Continue = b'c'
);

plain_reply!(
    /// Take the whole message as-is; send this filter nothing further
    Accept = b'a'
);

plain_reply!(
    /// Refuse the message (or the current recipient), telling the sender
    Reject = b'r'
);

plain_reply!(
    /// Ask the sender to come back later
    TemporaryFailure = b't'
);

plain_reply!(
    /// Swallow the message silently while pretending to deliver it
    Discard = b'd'
);

plain_reply!(
    /// Stop sending body chunks; only valid as an answer to one
    Skip = b's'
);

plain_reply!(
    /// Keep-alive during a long end-of-message computation
    Progress = b'p'
);

/// An explicit SMTP reply to hand to the sender
///
/// Carries the three-digit SMTP code, the enhanced status code and a free
/// text, e.g. `554 5.7.1 rejected by policy`.
#[derive(Debug, Clone, PartialEq)]
pub struct Replycode {
    code: u16,
    xcode: BytesMut,
    message: BytesMut,
}

impl Replycode {
    const CODE: u8 = b'y';

    /// Build a reply like `550 5.7.1 not today`.
    ///
    /// SMTP status codes have three digits; anything else is still framed
    /// correctly but will be refused by a conforming peer.
    #[must_use]
    pub fn new(code: u16, xcode: &str, message: &str) -> Self {
        Self {
            code,
            xcode: BytesMut::from(xcode.as_bytes()),
            message: BytesMut::from(message.as_bytes()),
        }
    }

    /// The three-digit SMTP status code
    #[must_use]
    pub fn smtp_code(&self) -> u16 {
        self.code
    }

    /// The enhanced status code, e.g. `5.7.1`
    #[must_use]
    pub fn xcode(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.xcode)
    }

    /// The free-text part of the reply
    #[must_use]
    pub fn message(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.message)
    }
}

impl Parsable for Replycode {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        // Trailing NUL first, then the space separated parts
        let Some(line) = buffer.take_until(0) else {
            return Err(Malformed::new("reply code missing its nul terminator", buffer).into());
        };
        let mut line = line;

        let Some(digits) = line.take_until(b' ') else {
            return Err(Malformed::new("reply code missing its smtp code", line).into());
        };
        let Ok(code) = String::from_utf8_lossy(&digits).parse::<u16>() else {
            return Err(Malformed::new("smtp code is not a number", digits).into());
        };
        if !(100..=999).contains(&code) {
            return Err(Malformed::new("smtp code must have three digits", digits).into());
        }

        let (xcode, message) = match line.take_until(b' ') {
            Some(xcode) => (xcode, line),
            None => (line, BytesMut::new()),
        };

        Ok(Self {
            code,
            xcode,
            message,
        })
    }
}

fn decimal_width(value: u16) -> usize {
    match value {
        0..=9 => 1,
        10..=99 => 2,
        100..=999 => 3,
        1000..=9999 => 4,
        _ => 5,
    }
}

impl Writable for Replycode {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.extend_from_slice(self.code.to_string().as_bytes());
        buffer.put_u8(b' ');
        buffer.extend_from_slice(&self.xcode);
        buffer.put_u8(b' ');
        buffer.extend_from_slice(&self.message);
        buffer.put_u8(0);
    }

    fn len(&self) -> usize {
        decimal_width(self.code) + 1 + self.xcode.len() + 1 + self.message.len() + 1
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        false
    }
}
