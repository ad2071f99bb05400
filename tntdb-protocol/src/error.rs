//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing, parsing or encoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame prefix byte {0:#04x}, expected u32 marker 0xce")]
    InvalidPrefix(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed greeting: {0}")]
    MalformedGreeting(String),

    #[error("unknown response header key {0:#04x}")]
    UnknownHeaderKey(u64),

    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("msgpack value encode error: {0}")]
    EncodeValue(rmpv::encode::Error),

    #[error("msgpack write error: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
