//! Length-delimited frame codec.
//!
//! Wire format: 4-byte big-endian length prefix covering the rest of the
//! frame, then a 2-byte big-endian message code, then the payload.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;
use crate::ProtocolError;

/// Maximum frame size (code + payload): 16 MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Message code size in bytes.
const CODE_SIZE: usize = 2;

/// Codec for framing [`Message`] values over a byte stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Parse a frame body (everything after the length prefix).
    pub fn decode_frame(frame: &[u8]) -> Result<Message, ProtocolError> {
        if frame.len() < CODE_SIZE {
            return Err(ProtocolError::Truncated(frame.len()));
        }
        let code = u16::from_be_bytes([frame[0], frame[1]]);
        Ok(Message::new(code, frame[CODE_SIZE..].to_vec()))
    }

    /// Encode a full frame (length prefix included) into `dst`.
    pub fn encode_frame(msg: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let frame_len = CODE_SIZE + msg.payload.len();
        if frame_len > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_u16(msg.code);
        dst.extend_from_slice(&msg.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_BYTES,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let frame = src.split_to(length);
        Self::decode_frame(&frame).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::encode_frame(&item, dst)
    }
}
