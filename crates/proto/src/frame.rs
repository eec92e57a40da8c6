//! Framing for the Execute stream: each message is prefixed with its
//! encoded length as a varint.

use bytes::{Buf, Bytes, BytesMut};
use prost::encoding::encode_varint;

use crate::encoding;
use crate::error::{CodecError, Result};
use crate::message::Message;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub fn encode_frame<M: Message>(message: &M) -> Bytes {
    let body = message.encode_to_bytes();
    let mut buf = BytesMut::with_capacity(body.len() + encoding::MAX_VARINT_LEN);
    encode_varint(body.len() as u64, &mut buf);
    buf.extend_from_slice(&body);
    buf.freeze()
}

/// Reassembles frames from chunks of a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete message, or `Ok(None)` if more bytes are
    /// needed.
    pub fn next_frame<M: Message>(&mut self) -> Result<Option<M>> {
        let Some((len, prefix)) = encoding::peek_varint(&self.buf)? else {
            return Ok(None);
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < prefix + len {
            return Ok(None);
        }

        self.buf.advance(prefix);
        let body = self.buf.split_to(len);
        M::decode(&body).map(Some)
    }

    /// Whether bytes of an incomplete frame are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
