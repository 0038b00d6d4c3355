//! RESP2 parser, encoder and tokio codec
//!
//! The parser works on a borrowed slice and only consumes input once a whole
//! value is available, so pipelined requests split across reads are safe.

use super::types::{RespValue, RespError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// Upper bound on a single bulk string (512 MiB, as Redis)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// RESP2 Parser
pub struct RespParser;

impl RespParser {
    /// Parse a RESP value from a buffer
    ///
    /// Returns Ok(Some(value)) if a complete value was parsed (and consumed),
    /// Ok(None) if more data is needed,
    /// Err(e) if parsing failed
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        match Self::parse_at(&buf[..], 0)? {
            Some((value, end)) => {
                buf.advance(end);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse one value starting at `pos`, returning it with the end offset
    fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespError> {
        if pos >= buf.len() {
            return Ok(None);
        }

        let (line, next) = match Self::line_at(buf, pos) {
            Some(found) => found,
            None => return Ok(None),
        };
        if line.is_empty() {
            return Err(RespError::InvalidProtocol("Empty line".to_string()));
        }
        let body = &line[1..];

        match line[0] {
            b'+' => {
                let s = std::str::from_utf8(body).map_err(|_| RespError::InvalidUtf8)?;
                Ok(Some((RespValue::SimpleString(s.to_string()), next)))
            }
            b'-' => {
                let s = std::str::from_utf8(body).map_err(|_| RespError::InvalidUtf8)?;
                Ok(Some((RespValue::Error(s.to_string()), next)))
            }
            b':' => Ok(Some((RespValue::Integer(Self::parse_int(body)?), next))),
            b'$' => {
                let len = Self::parse_int(body)?;
                if len == -1 {
                    return Ok(Some((RespValue::Null, next)));
                }
                if !(0..=MAX_BULK_LEN).contains(&len) {
                    return Err(RespError::InvalidProtocol(format!(
                        "Invalid bulk string length: {}",
                        len
                    )));
                }

                let end = next + len as usize;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != CRLF {
                    return Err(RespError::InvalidProtocol(
                        "Missing CRLF after bulk string data".to_string(),
                    ));
                }
                let data = Bytes::copy_from_slice(&buf[next..end]);
                Ok(Some((RespValue::BulkString(data), end + 2)))
            }
            b'*' => {
                let count = Self::parse_int(body)?;
                if count == -1 {
                    return Ok(Some((RespValue::Null, next)));
                }
                if count < 0 {
                    return Err(RespError::InvalidProtocol(format!(
                        "Invalid array count: {}",
                        count
                    )));
                }

                let mut elements = Vec::with_capacity((count as usize).min(1024));
                let mut cursor = next;
                for _ in 0..count {
                    match Self::parse_at(buf, cursor)? {
                        Some((value, end)) => {
                            elements.push(value);
                            cursor = end;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(elements), cursor)))
            }
            other => Err(RespError::InvalidProtocol(format!(
                "Unknown type prefix: {}",
                other as char
            ))),
        }
    }

    /// Find the CRLF-terminated line starting at `pos`
    ///
    /// Returns the line without its terminator and the offset just past it.
    fn line_at(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        let rest = &buf[pos..];
        let idx = rest.windows(2).position(|w| w == CRLF)?;
        Some((&rest[..idx], pos + idx + 2))
    }

    fn parse_int(digits: &[u8]) -> Result<i64, RespError> {
        let s = std::str::from_utf8(digits).map_err(|_| RespError::InvalidUtf8)?;
        s.parse::<i64>().map_err(|_| RespError::IntegerOverflow)
    }
}

/// RESP2 Encoder
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_to(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_to(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(bytes) => {
                buf.put_u8(b'$');
                buf.put_slice(bytes.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(bytes);
                buf.put_slice(CRLF);
            }
            RespValue::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            RespValue::Array(arr) => {
                buf.put_u8(b'*');
                buf.put_slice(arr.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for elem in arr {
                    Self::encode_to(buf, elem);
                }
            }
        }
    }
}

/// Frames a byte stream into RESP values
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        RespParser::parse(src)
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), RespError> {
        RespEncoder::encode_to(dst, &item);
        Ok(())
    }
}
