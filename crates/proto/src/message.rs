//! Messages of the agent control protocol.
//!
//! Every message keeps the raw bytes of fields it does not recognize and
//! writes them back after its known fields, so a coordinator and an agent of
//! different versions can relay each other's messages without loss.

use bytes::{Bytes, BytesMut};
use prost::encoding::{decode_key, skip_field, string, DecodeContext, WireType};
use std::fmt;

use crate::encoding;
use crate::error::Result;

pub trait Message: Default + Sized {
    /// Writes the known fields in ascending tag order, omitting zero values.
    fn encode_fields(&self, buf: &mut BytesMut);

    /// Decodes one known field. Returns `Ok(false)` when the tag is unknown
    /// and the value has not been consumed.
    fn merge_field(&mut self, tag: u32, wire_type: WireType, buf: &mut &[u8]) -> Result<bool>;

    fn unknown_fields(&self) -> &[u8];

    fn unknown_fields_mut(&mut self) -> &mut Vec<u8>;

    fn encode(&self, buf: &mut BytesMut) {
        self.encode_fields(buf);
        buf.extend_from_slice(self.unknown_fields());
    }

    fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn merge(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let start = buf;
            let (tag, wire_type) = decode_key(&mut buf)?;
            if !self.merge_field(tag, wire_type, &mut buf)? {
                skip_field(wire_type, tag, &mut buf, DecodeContext::default())?;
                let consumed = start.len() - buf.len();
                self.unknown_fields_mut()
                    .extend_from_slice(&start[..consumed]);
            }
        }
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let mut message = Self::default();
        message.merge(buf)?;
        Ok(message)
    }
}

macro_rules! empty_message {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub unknown_fields: Vec<u8>,
        }

        impl Message for $name {
            fn encode_fields(&self, _buf: &mut BytesMut) {}

            fn merge_field(
                &mut self,
                _tag: u32,
                _wire_type: WireType,
                _buf: &mut &[u8],
            ) -> Result<bool> {
                Ok(false)
            }

            fn unknown_fields(&self) -> &[u8] {
                &self.unknown_fields
            }

            fn unknown_fields_mut(&mut self) -> &mut Vec<u8> {
                &mut self.unknown_fields
            }
        }
    };
}

empty_message!(
    /// Starts the installation work on the agent.
    ExecuteRequest
);
empty_message!(
    /// Asks the agent process to exit.
    ShutdownRequest
);
empty_message!(ShutdownResponse);
empty_message!(
    /// Asks the agent to stop in-flight work and clean up.
    AbortRequest
);

/// Error reported by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Error {
    pub message: String,
    pub unknown_fields: Vec<u8>,
}

impl Error {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            unknown_fields: Vec::new(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Message for Error {
    fn encode_fields(&self, buf: &mut BytesMut) {
        if !self.message.is_empty() {
            string::encode(1, &self.message, buf);
        }
    }

    fn merge_field(&mut self, tag: u32, wire_type: WireType, buf: &mut &[u8]) -> Result<bool> {
        match tag {
            1 => string::merge(wire_type, &mut self.message, buf, DecodeContext::default())?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn unknown_fields(&self) -> &[u8] {
        &self.unknown_fields
    }

    fn unknown_fields_mut(&mut self) -> &mut Vec<u8> {
        &mut self.unknown_fields
    }
}

/// Outcome of an abort. No error means the cleanup succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbortResponse {
    pub error: Option<Error>,
    pub unknown_fields: Vec<u8>,
}

impl AbortResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(Error::new(message)),
            unknown_fields: Vec::new(),
        }
    }
}

impl Message for AbortResponse {
    fn encode_fields(&self, buf: &mut BytesMut) {
        if let Some(ref error) = self.error {
            encoding::encode_message(1, error, buf);
        }
    }

    fn merge_field(&mut self, tag: u32, wire_type: WireType, buf: &mut &[u8]) -> Result<bool> {
        match tag {
            1 => {
                let error = self.error.get_or_insert_with(Error::default);
                encoding::merge_message(tag, wire_type, error, buf)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn unknown_fields(&self) -> &[u8] {
        &self.unknown_fields
    }

    fn unknown_fields_mut(&mut self) -> &mut Vec<u8> {
        &mut self.unknown_fields
    }
}

/// One update on the Execute stream.
///
/// `complete` marks the last message of a session. Errors accumulate and
/// any error means the session failed, whether or not it is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressMessage {
    pub message: String,
    pub complete: bool,
    pub errors: Vec<Error>,
    pub unknown_fields: Vec<u8>,
}

impl ProgressMessage {
    pub fn step(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            complete: true,
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: Error) -> Self {
        self.errors.push(error);
        self
    }

    pub fn is_failure(&self) -> bool {
        !self.errors.is_empty()
    }
}

impl Message for ProgressMessage {
    fn encode_fields(&self, buf: &mut BytesMut) {
        if !self.message.is_empty() {
            string::encode(1, &self.message, buf);
        }
        if self.complete {
            prost::encoding::bool::encode(2, &self.complete, buf);
        }
        for error in &self.errors {
            encoding::encode_message(3, error, buf);
        }
    }

    fn merge_field(&mut self, tag: u32, wire_type: WireType, buf: &mut &[u8]) -> Result<bool> {
        match tag {
            1 => string::merge(wire_type, &mut self.message, buf, DecodeContext::default())?,
            2 => prost::encoding::bool::merge(
                wire_type,
                &mut self.complete,
                buf,
                DecodeContext::default(),
            )?,
            3 => {
                let mut error = Error::default();
                encoding::merge_message(tag, wire_type, &mut error, buf)?;
                self.errors.push(error);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn unknown_fields(&self) -> &[u8] {
        &self.unknown_fields
    }

    fn unknown_fields_mut(&mut self) -> &mut Vec<u8> {
        &mut self.unknown_fields
    }
}
