//! Macros: out-of-band key/value pairs attached to the next stage command

use bytes::{BufMut, BytesMut};

use crate::buf::BufExt;
use crate::wire::{Parsable, Writable};
use crate::{ProtocolError, Truncated};

/// A set of macros for the stage identified by [`Macro::stage_code`]
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Macro {
    /// The frame code of the stage command these macros belong to
    pub stage_code: u8,
    pairs: Vec<(BytesMut, BytesMut)>,
}

impl Macro {
    const CODE: u8 = b'D';

    /// Macros for the stage identified by `stage_code`
    #[must_use]
    pub fn new(stage_code: u8, pairs: &[(&[u8], &[u8])]) -> Self {
        Self {
            stage_code,
            pairs: pairs
                .iter()
                .map(|(name, value)| (BytesMut::from(*name), BytesMut::from(*value)))
                .collect(),
        }
    }

    /// Iterate the contained `(name, value)` pairs
    pub fn pairs(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.pairs.iter().map(|(name, value)| (&name[..], &value[..]))
    }
}

impl Parsable for Macro {
    const CODE: u8 = Self::CODE;

    fn parse(mut buffer: BytesMut) -> Result<Self, ProtocolError> {
        let Some(stage_code) = buffer.take_u8() else {
            return Err(Truncated::new("macro stage code", 1, 0).into());
        };

        // Every pair contributes two nul bytes
        let field_count = bytecount::count(&buffer, 0);
        let mut pairs = Vec::with_capacity(field_count / 2);
        while !buffer.is_empty() {
            let Some(name) = buffer.take_until(0) else {
                return Err(Truncated::new("macro name", 1, 0).into());
            };
            let Some(value) = buffer.take_until(0) else {
                return Err(Truncated::new("macro value", 1, 0).into());
            };
            pairs.push((name, value));
        }

        Ok(Self { stage_code, pairs })
    }
}

impl Writable for Macro {
    fn write(&self, buffer: &mut BytesMut) {
        buffer.put_u8(self.stage_code);
        for (name, value) in &self.pairs {
            buffer.extend_from_slice(name);
            buffer.put_u8(0);
            buffer.extend_from_slice(value);
            buffer.put_u8(0);
        }
    }

    fn len(&self) -> usize {
        1 + self
            .pairs
            .iter()
            .map(|(name, value)| name.len() + 1 + value.len() + 1)
            .sum::<usize>()
    }

    fn code(&self) -> u8 {
        Self::CODE
    }

    fn is_empty(&self) -> bool {
        false
    }
}
