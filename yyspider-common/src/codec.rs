//! Wire codec
//!
//! Every frame is a 4-byte unsigned big-endian length followed by that many
//! payload bytes. [`FrameCodec`] deals in raw payloads; [`MessageCodec`]
//! layers MessagePack-encoded [`Message`] maps on top of it.
//!
//! The declared length is checked against the maximum as soon as the header
//! is buffered, so an oversized frame fails before any of its payload is read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::Message;
use crate::{Error, Result};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound for a single frame payload (1 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prefix `payload` with its 4-byte big-endian length
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidInput(format!("payload of {} bytes", payload.len())))?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Length-prefixed framing
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut header = [0u8; LENGTH_PREFIX_LEN];
        header.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = LENGTH_PREFIX_LEN + len;
        if src.len() < total {
            // Bounded by max_frame_len, checked above
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_len {
            return Err(Error::FrameTooLarge {
                len: item.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(LENGTH_PREFIX_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Framed MessagePack codec for [`Message`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec {
    frames: FrameCodec,
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            frames: FrameCodec::with_max_frame_len(max_frame_len),
        }
    }

    /// Serialize a message as a MessagePack map (field names kept)
    pub fn to_payload(message: &Message) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(message)?)
    }

    /// MessagePack size of `value` as it would appear inside a message
    pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> Result<usize> {
        Ok(rmp_serde::to_vec_named(value)?.len())
    }

    pub fn max_frame_len(&self) -> usize {
        self.frames.max_frame_len()
    }

    pub fn from_payload(payload: &[u8]) -> Result<Message> {
        Ok(rmp_serde::from_slice(payload)?)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(Self::from_payload(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = Self::to_payload(&item)?;
        self.frames.encode(Bytes::from(payload), dst)
    }
}
