//! Field helpers on top of `prost::encoding`.
//!
//! Scalars, keys and skipping come straight from prost. Embedded messages go
//! through the crate's own [`Message`] trait so they keep unknown fields,
//! which prost's derived messages discard.

use bytes::{Buf, BufMut, BytesMut};
use prost::encoding::{check_wire_type, decode_varint, encode_key, encode_varint, WireType};

use crate::error::{CodecError, Result};
use crate::message::Message;

/// Longest encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Reads a varint from the front of `buf` without consuming it.
///
/// Returns `Ok(None)` when `buf` ends before the varint does.
pub fn peek_varint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let Some(last) = buf
        .iter()
        .take(MAX_VARINT_LEN)
        .position(|byte| byte & 0x80 == 0)
    else {
        if buf.len() < MAX_VARINT_LEN {
            return Ok(None);
        }
        return Err(CodecError::InvalidFrameLength);
    };

    let mut cursor = &buf[..=last];
    let value = decode_varint(&mut cursor).map_err(|_| CodecError::InvalidFrameLength)?;
    Ok(Some((value, last + 1)))
}

pub fn encode_message<M: Message>(tag: u32, message: &M, buf: &mut BytesMut) {
    let body = message.encode_to_bytes();
    encode_key(tag, WireType::LengthDelimited, buf);
    encode_varint(body.len() as u64, buf);
    buf.put_slice(&body);
}

/// Merges an embedded message into `message`. Repeated occurrences of a
/// singular message field merge into the same value.
pub fn merge_message<M: Message>(
    tag: u32,
    wire_type: WireType,
    message: &mut M,
    buf: &mut &[u8],
) -> Result<()> {
    check_wire_type(WireType::LengthDelimited, wire_type)?;
    let len = decode_varint(buf)?;
    if len > buf.remaining() as u64 {
        return Err(CodecError::Truncated(tag));
    }
    let (body, rest) = buf.split_at(len as usize);
    *buf = rest;
    message.merge(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Error;

    #[test]
    fn test_peek_varint() {
        assert_eq!(peek_varint(&[0xac, 0x02, 0x09]).unwrap(), Some((300, 2)));
        assert_eq!(peek_varint(&[0xac]).unwrap(), None);
        assert_eq!(peek_varint(&[]).unwrap(), None);
    }

    #[test]
    fn test_peek_varint_rejects_overlong_prefix() {
        assert_eq!(
            peek_varint(&[0xff; 11]),
            Err(CodecError::InvalidFrameLength)
        );
        // ten bytes, but the last one carries more than the 64th bit
        let mut overflow = [0xff; 10];
        overflow[9] = 0x02;
        assert_eq!(peek_varint(&overflow), Err(CodecError::InvalidFrameLength));
    }

    #[test]
    fn test_embedded_message_layout() {
        let mut buf = BytesMut::new();
        encode_message(3, &Error::new("x"), &mut buf);
        assert_eq!(&buf[..], &[0x1a, 0x03, 0x0a, 0x01, b'x']);
    }

    #[test]
    fn test_truncated_embedded_message() {
        let mut slice: &[u8] = &[0x05, 0x0a];
        let mut error = Error::default();
        assert_eq!(
            merge_message(3, WireType::LengthDelimited, &mut error, &mut slice),
            Err(CodecError::Truncated(3))
        );
    }

    #[test]
    fn test_embedded_message_wrong_wire_type() {
        let mut slice: &[u8] = &[0x01];
        let mut error = Error::default();
        assert!(matches!(
            merge_message(3, WireType::Varint, &mut error, &mut slice),
            Err(CodecError::Decode(_))
        ));
    }
}
