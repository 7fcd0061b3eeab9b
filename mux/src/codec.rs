//! Framing for the backend side: we write MTA messages, we read filter
//! replies

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, BytesMut};

use muxtr_proto::wire::{FilterReply, MtaMessage, Writable};
use muxtr_proto::ProtocolError;

/// The largest frame either side may produce: 64 KiB of payload plus the
/// code byte
pub(crate) const MAX_FRAME_SIZE: usize = 65536 + 1;

/// Encodes [`MtaMessage`]s and decodes [`FilterReply`]s on one backend
/// transport
#[derive(Debug, Clone)]
pub(crate) struct FilterCodec {
    max_frame_size: usize,
}

impl FilterCodec {
    pub(crate) fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FilterCodec {
    type Item = FilterReply;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = split_frame(src, self.max_frame_size)? else {
            return Ok(None);
        };

        Ok(Some(FilterReply::parse(frame)?))
    }
}

impl Encoder for FilterCodec {
    type Item<'i> = &'i MtaMessage;
    type Error = ProtocolError;

    fn encode(&mut self, item: &MtaMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(item, dst, self.max_frame_size)
    }
}

/// Take one complete `length | code | payload` frame off `src`, the header
/// stripped to the code byte onward.
pub(crate) fn split_frame(
    src: &mut BytesMut,
    max_frame_size: usize,
) -> Result<Option<BytesMut>, ProtocolError> {
    if src.len() < 4 {
        // The length marker is not even complete
        return Ok(None);
    }

    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&src[..4]);
    let length = u32::from_be_bytes(length_bytes) as usize;

    // Bound the frame before buffering it; a bogus length must not make us
    // allocate without limit
    if length > max_frame_size {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if src.len() < 4 + length {
        src.reserve(4 + length - src.len());
        return Ok(None);
    }

    let mut frame = src.split_to(4 + length);
    frame.advance(4);

    Ok(Some(frame))
}

/// Append one `length | code | payload` frame for `item` to `dst`.
pub(crate) fn write_frame<W: Writable>(
    item: &W,
    dst: &mut BytesMut,
    max_frame_size: usize,
) -> Result<(), ProtocolError> {
    let payload_len = item.len();
    let frame_len = payload_len
        .checked_add(1)
        .ok_or(ProtocolError::FrameTooLarge(payload_len))?;
    if frame_len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge(frame_len));
    }

    dst.reserve(4 + frame_len);
    dst.put_u32(frame_len as u32);
    dst.put_u8(item.code());
    item.write(dst);

    Ok(())
}
