use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Field {0} is longer than the remaining buffer")]
    Truncated(u32),

    #[error("Frame length prefix is not a valid varint")]
    InvalidFrameLength,

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;
