//! # tntdb-protocol
//!
//! Wire protocol layer for the tntdb Tarantool client.
//!
//! This crate provides:
//! - Length-prefixed MessagePack framing (encoder and incremental decoder)
//! - IPROTO command codes, map keys and iterator kinds
//! - Parsed response model
//! - Greeting parsing and the chap-sha1 scramble
//!
//! It performs no I/O; the async connection lives in `tntdb-client`.

pub mod codec;
pub mod consts;
pub mod error;
pub mod greeting;
pub mod response;

pub use codec::{Decoder, Encoder, FRAME_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use consts::{IteratorType, RequestType, ResponseCode, UnknownIterator};
pub use error::ProtocolError;
pub use greeting::{scramble, Greeting, GREETING_SIZE, SALT_B64_LEN, SCRAMBLE_SIZE};
pub use response::{Header, Response};

/// Default port the server listens on.
pub const DEFAULT_PORT: u16 = 3301;
