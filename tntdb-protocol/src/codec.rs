//! Frame encoder and incremental response decoder.
//!
//! Frame layout (5-byte prefix + two MessagePack objects):
//!
//! ```text
//! +------+-------------+------------------+----------------------+
//! | 0xce | payload len |   header map     |   body map or nil    |
//! |1 byte| 4 bytes BE  | {code, sync}     | command-specific     |
//! +------+-------------+------------------+----------------------+
//! ```
//!
//! The prefix is a MessagePack u32: the encoder writes a placeholder value,
//! serializes the header and body behind it, then patches bytes 1..5 with
//! the measured payload length.

use bytes::{Buf, BufMut, BytesMut};
use rmpv::Value;

use crate::consts::{body, header, RequestType, ResponseCode, RESPONSE_OK};
use crate::error::ProtocolError;
use crate::response::{Header, Response};

/// Size of the length prefix: the u32 marker plus the big-endian length.
pub const FRAME_PREFIX_SIZE: usize = 5;

/// MessagePack u32 marker, always the first byte of a frame.
pub const U32_MARKER: u8 = 0xce;

/// Upper bound on a single frame payload (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes request and response frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request frame: prefix, `{code, sync}` header map, then the
    /// body map (or nil when the command carries no body).
    pub fn encode_request(
        request: RequestType,
        sync: u64,
        request_body: Option<&[(u8, Value)]>,
    ) -> Result<BytesMut, ProtocolError> {
        let mut wr = BytesMut::with_capacity(64).writer();

        rmp::encode::write_u32(&mut wr, 0)?;
        rmp::encode::write_map_len(&mut wr, 2)?;
        rmp::encode::write_uint(&mut wr, u64::from(header::CODE))?;
        rmp::encode::write_uint(&mut wr, request as u64)?;
        rmp::encode::write_uint(&mut wr, u64::from(header::SYNC))?;
        rmp::encode::write_uint(&mut wr, sync)?;

        match request_body {
            Some(entries) => {
                rmp::encode::write_map_len(&mut wr, entries.len() as u32)?;
                for (key, value) in entries {
                    rmp::encode::write_uint(&mut wr, u64::from(*key))?;
                    rmpv::encode::write_value(&mut wr, value)?;
                }
            }
            None => rmp::encode::write_nil(&mut wr)?,
        }

        Ok(patch_prefix(wr.into_inner()))
    }

    /// Encodes a success response frame. `data` of `None` produces a frame
    /// with no body at all.
    pub fn encode_ok_response(
        sync: u64,
        schema_id: u32,
        data: Option<&[Value]>,
    ) -> Result<BytesMut, ProtocolError> {
        let mut wr = BytesMut::with_capacity(64).writer();

        rmp::encode::write_u32(&mut wr, 0)?;
        write_response_header(&mut wr, RESPONSE_OK, sync, schema_id)?;
        if let Some(tuples) = data {
            rmp::encode::write_map_len(&mut wr, 1)?;
            rmp::encode::write_uint(&mut wr, u64::from(body::DATA))?;
            rmp::encode::write_array_len(&mut wr, tuples.len() as u32)?;
            for tuple in tuples {
                rmpv::encode::write_value(&mut wr, tuple)?;
            }
        }

        Ok(patch_prefix(wr.into_inner()))
    }

    /// Encodes an error response frame carrying the server error string.
    pub fn encode_error_response(
        sync: u64,
        schema_id: u32,
        code: u32,
        message: &str,
    ) -> Result<BytesMut, ProtocolError> {
        debug_assert_ne!(code, RESPONSE_OK);
        let mut wr = BytesMut::with_capacity(64).writer();

        rmp::encode::write_u32(&mut wr, 0)?;
        write_response_header(&mut wr, code, sync, schema_id)?;
        rmp::encode::write_map_len(&mut wr, 1)?;
        rmp::encode::write_uint(&mut wr, u64::from(body::ERROR))?;
        rmp::encode::write_str(&mut wr, message)?;

        Ok(patch_prefix(wr.into_inner()))
    }
}

fn write_response_header<W>(wr: &mut W, code: u32, sync: u64, schema_id: u32) -> Result<(), ProtocolError>
where
    W: std::io::Write,
{
    rmp::encode::write_map_len(wr, 3)?;
    rmp::encode::write_uint(wr, u64::from(header::CODE))?;
    rmp::encode::write_uint(wr, u64::from(code))?;
    rmp::encode::write_uint(wr, u64::from(header::SYNC))?;
    rmp::encode::write_uint(wr, sync)?;
    rmp::encode::write_uint(wr, u64::from(header::SCHEMA_ID))?;
    rmp::encode::write_uint(wr, u64::from(schema_id))?;
    Ok(())
}

/// Overwrites bytes 1..5 of the placeholder u32 with the measured payload
/// length. Byte 0 stays the u32 marker.
fn patch_prefix(mut buf: BytesMut) -> BytesMut {
    let payload = (buf.len() - FRAME_PREFIX_SIZE) as u32;
    buf[1..FRAME_PREFIX_SIZE].copy_from_slice(&payload.to_be_bytes());
    buf
}

/// Incremental response decoder over a growable buffer.
///
/// Feed socket reads with [`Decoder::extend`]; [`Decoder::decode_response`]
/// yields `Ok(None)` until a whole frame is buffered.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Attempts to decode the next response frame from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        if self.buffer.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        if self.buffer[0] != U32_MARKER {
            return Err(ProtocolError::InvalidPrefix(self.buffer[0]));
        }
        let size =
            u32::from_be_bytes(self.buffer[1..FRAME_PREFIX_SIZE].try_into().unwrap()) as usize;
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() < FRAME_PREFIX_SIZE + size {
            return Ok(None);
        }

        self.buffer.advance(FRAME_PREFIX_SIZE);
        let frame = self.buffer.split_to(size);
        parse_frame(&frame).map(Some)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_frame(frame: &[u8]) -> Result<Response, ProtocolError> {
    const CODE: u64 = header::CODE as u64;
    const SYNC: u64 = header::SYNC as u64;
    const SCHEMA_ID: u64 = header::SCHEMA_ID as u64;

    let mut rd = frame;
    let entries = match rmpv::decode::read_value(&mut rd)? {
        Value::Map(entries) => entries,
        _ => return Err(ProtocolError::MalformedResponse("header is not a map")),
    };

    let mut code = None;
    let mut sync = None;
    let mut schema_id = 0u32;
    for (key, value) in entries {
        let key = key
            .as_u64()
            .ok_or(ProtocolError::MalformedResponse("non-integer header key"))?;
        match key {
            CODE => {
                let raw = value
                    .as_u64()
                    .ok_or(ProtocolError::MalformedResponse("code is not an integer"))?;
                code = Some(ResponseCode::from_raw(raw as u32));
            }
            SYNC => {
                sync = Some(
                    value
                        .as_u64()
                        .ok_or(ProtocolError::MalformedResponse("sync is not an integer"))?,
                );
            }
            SCHEMA_ID => {
                schema_id = value.as_u64().unwrap_or(0) as u32;
            }
            other => return Err(ProtocolError::UnknownHeaderKey(other)),
        }
    }

    let header = Header {
        code: code.ok_or(ProtocolError::MalformedResponse("missing code"))?,
        sync: sync.ok_or(ProtocolError::MalformedResponse("missing sync"))?,
        schema_id,
    };

    let mut data = None;
    let mut error = None;
    if !rd.is_empty() {
        match rmpv::decode::read_value(&mut rd)? {
            Value::Nil => {}
            Value::Map(entries) => {
                for (key, value) in entries {
                    let Some(key) = key.as_u64() else { continue };
                    if key == u64::from(body::DATA) {
                        match value {
                            Value::Array(items) => data = Some(items),
                            _ => {
                                return Err(ProtocolError::MalformedResponse(
                                    "data is not an array",
                                ))
                            }
                        }
                    } else if key == u64::from(body::ERROR) {
                        match value {
                            Value::String(s) => {
                                error = Some(s.into_str().ok_or(
                                    ProtocolError::MalformedResponse(
                                        "error message is not valid utf-8",
                                    ),
                                )?);
                            }
                            _ => {
                                return Err(ProtocolError::MalformedResponse(
                                    "error message is not a string",
                                ))
                            }
                        }
                    }
                }
                if header.code.is_ok() && data.is_none() {
                    return Err(ProtocolError::MalformedResponse("success body missing data"));
                }
            }
            _ => return Err(ProtocolError::MalformedResponse("body is neither map nor nil")),
        }
    }

    if !header.code.is_ok() && error.is_none() {
        return Err(ProtocolError::MalformedResponse(
            "error response without message",
        ));
    }

    Ok(Response {
        header,
        data,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wraps a hand-built payload in the 5-byte prefix.
    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![U32_MARKER];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn decode_one(bytes: &[u8]) -> Result<Option<Response>, ProtocolError> {
        let mut decoder = Decoder::new();
        decoder.extend(bytes);
        decoder.decode_response()
    }

    #[test]
    fn test_request_frame_layout() {
        let key = vec![Value::from(5u64)];
        let request_body = [(body::KEY, Value::Array(key))];
        let encoded =
            Encoder::encode_request(RequestType::Select, 3, Some(&request_body)).unwrap();

        assert_eq!(encoded[0], U32_MARKER);
        let len = u32::from_be_bytes(encoded[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - FRAME_PREFIX_SIZE);

        let mut rd = &encoded[FRAME_PREFIX_SIZE..];
        let hdr = rmpv::decode::read_value(&mut rd).unwrap();
        let entries = hdr.as_map().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.as_u64(), Some(u64::from(header::CODE)));
        assert_eq!(entries[0].1.as_u64(), Some(RequestType::Select as u64));
        assert_eq!(entries[1].0.as_u64(), Some(u64::from(header::SYNC)));
        assert_eq!(entries[1].1.as_u64(), Some(3));

        let parsed_body = rmpv::decode::read_value(&mut rd).unwrap();
        let entries = parsed_body.as_map().unwrap();
        assert_eq!(entries[0].0.as_u64(), Some(u64::from(body::KEY)));
        assert!(rd.is_empty());
    }

    #[test]
    fn test_bodyless_request_encodes_nil() {
        let encoded = Encoder::encode_request(RequestType::Ping, 1, None).unwrap();
        let mut rd = &encoded[FRAME_PREFIX_SIZE..];
        rmpv::decode::read_value(&mut rd).unwrap();
        let parsed_body = rmpv::decode::read_value(&mut rd).unwrap();
        assert!(parsed_body.is_nil());
    }

    #[test]
    fn test_ok_response_roundtrip() {
        let tuples = vec![Value::Array(vec![
            Value::from(1u64),
            Value::from("vlad"),
            Value::from(75u64),
        ])];
        let encoded = Encoder::encode_ok_response(9, 80, Some(&tuples)).unwrap();

        let response = decode_one(&encoded).unwrap().unwrap();
        assert!(response.is_ok());
        assert_eq!(response.header.sync, 9);
        assert_eq!(response.header.schema_id, 80);
        assert_eq!(response.data.as_deref(), Some(&tuples[..]));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_bodyless_response_roundtrip() {
        let encoded = Encoder::encode_ok_response(4, 0, None).unwrap();
        let response = decode_one(&encoded).unwrap().unwrap();
        assert!(response.is_ok());
        assert!(response.data.is_none());
    }

    #[test]
    fn test_error_response_roundtrip() {
        let encoded =
            Encoder::encode_error_response(5, 80, 0x8002, "Duplicate key exists").unwrap();
        let response = decode_one(&encoded).unwrap().unwrap();
        assert!(response.is_error());
        assert_eq!(response.header.code, ResponseCode::Error(0x8002));
        assert_eq!(response.error_message(), Some("Duplicate key exists"));
        assert!(response.data.is_none());
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let encoded = Encoder::encode_ok_response(1, 0, None).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded[..3]);
        assert!(decoder.decode_response().unwrap().is_none());

        decoder.extend(&encoded[3..encoded.len() - 1]);
        assert!(decoder.decode_response().unwrap().is_none());

        decoder.extend(&encoded[encoded.len() - 1..]);
        let response = decoder.decode_response().unwrap().unwrap();
        assert_eq!(response.header.sync, 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut decoder = Decoder::new();
        decoder.extend(&Encoder::encode_ok_response(1, 0, None).unwrap());
        decoder.extend(&Encoder::encode_ok_response(2, 0, None).unwrap());

        assert_eq!(decoder.decode_response().unwrap().unwrap().sync(), 1);
        assert_eq!(decoder.decode_response().unwrap().unwrap().sync(), 2);
        assert!(decoder.decode_response().unwrap().is_none());
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let result = decode_one(&[0xc0, 0, 0, 0, 1, 0xc0]);
        assert!(matches!(result, Err(ProtocolError::InvalidPrefix(0xc0))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut bytes = vec![U32_MARKER];
        bytes.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        let result = decode_one(&bytes);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_unknown_header_key_rejected() {
        let mut payload = Vec::new();
        rmp::encode::write_map_len(&mut payload, 3).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::CODE)).unwrap();
        rmp::encode::write_uint(&mut payload, 0).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::SYNC)).unwrap();
        rmp::encode::write_uint(&mut payload, 1).unwrap();
        rmp::encode::write_uint(&mut payload, 0x42).unwrap();
        rmp::encode::write_uint(&mut payload, 0).unwrap();

        let result = decode_one(&frame(&payload));
        assert!(matches!(result, Err(ProtocolError::UnknownHeaderKey(0x42))));
    }

    #[test]
    fn test_success_body_without_data_rejected() {
        let mut payload = Vec::new();
        rmp::encode::write_map_len(&mut payload, 2).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::CODE)).unwrap();
        rmp::encode::write_uint(&mut payload, 0).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::SYNC)).unwrap();
        rmp::encode::write_uint(&mut payload, 1).unwrap();
        rmp::encode::write_map_len(&mut payload, 0).unwrap();

        let result = decode_one(&frame(&payload));
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedResponse("success body missing data"))
        ));
    }

    #[test]
    fn test_non_array_data_rejected() {
        let mut payload = Vec::new();
        rmp::encode::write_map_len(&mut payload, 2).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::CODE)).unwrap();
        rmp::encode::write_uint(&mut payload, 0).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::SYNC)).unwrap();
        rmp::encode::write_uint(&mut payload, 1).unwrap();
        rmp::encode::write_map_len(&mut payload, 1).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(body::DATA)).unwrap();
        rmp::encode::write_uint(&mut payload, 42).unwrap();

        let result = decode_one(&frame(&payload));
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedResponse("data is not an array"))
        ));
    }

    #[test]
    fn test_error_without_message_rejected() {
        let mut payload = Vec::new();
        rmp::encode::write_map_len(&mut payload, 2).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::CODE)).unwrap();
        rmp::encode::write_uint(&mut payload, 0x8002).unwrap();
        rmp::encode::write_uint(&mut payload, u64::from(header::SYNC)).unwrap();
        rmp::encode::write_uint(&mut payload, 1).unwrap();

        let result = decode_one(&frame(&payload));
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedResponse(
                "error response without message"
            ))
        ));
    }
}
