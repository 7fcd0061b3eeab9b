//! Framing for the MTA side: we read MTA commands, we write filter messages

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, BytesMut};

use muxtr_proto::wire::{FilterMessage, MtaCommand, Writable};
use muxtr_proto::ProtocolError;

/// The largest frame either side may produce: 64 KiB of payload plus the
/// code byte
pub(crate) const MAX_FRAME_SIZE: usize = 65536 + 1;

/// Decodes [`MtaCommand`]s and encodes [`FilterMessage`]s on the MTA
/// connection
#[derive(Debug, Clone)]
pub(crate) struct MilterCodec {
    max_frame_size: usize,
}

impl MilterCodec {
    pub(crate) fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for MilterCodec {
    type Item = MtaCommand;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // The length marker is not even complete
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        // Bound the frame before buffering it; a bogus length must not
        // make us allocate without limit
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(4 + length);
        frame.advance(4);

        Ok(Some(MtaCommand::parse(frame)?))
    }
}

impl Encoder for MilterCodec {
    type Item<'i> = &'i FilterMessage;
    type Error = ProtocolError;

    fn encode(&mut self, item: &FilterMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = item.len();
        let frame_len = payload_len
            .checked_add(1)
            .ok_or(ProtocolError::FrameTooLarge(payload_len))?;
        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(frame_len));
        }

        dst.reserve(4 + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u8(item.code());
        item.write(dst);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use muxtr_proto::replies::{Continue, Reply};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decode_mta_command() {
        let mut codec = MilterCodec::new(MAX_FRAME_SIZE);

        let mut buffer = BytesMut::from(&[0u8, 0, 0, 1, b'T'][..]);
        let command = codec
            .decode(&mut buffer)
            .expect("valid frame")
            .expect("complete frame");
        assert!(matches!(command, MtaCommand::Data(_)));
    }

    #[test]
    fn encode_reply() {
        let mut codec = MilterCodec::new(MAX_FRAME_SIZE);
        let message = FilterMessage::Reply(Reply::Continue(Continue));

        let mut buffer = BytesMut::new();
        codec.encode(&message, &mut buffer).expect("encodes");

        assert_eq!(&buffer[..], [0, 0, 0, 1, b'c']);
    }

    #[test]
    fn decode_rejects_bogus_length() {
        let mut codec = MilterCodec::new(MAX_FRAME_SIZE);

        let mut buffer = BytesMut::from(&[0xff_u8, 0xff, 0xff, 0xff, b'c'][..]);
        codec
            .decode(&mut buffer)
            .expect_err("length beyond the frame cap");
    }
}
