//! RESP2 value types
//!
//! Defines the reply/request values exchanged with RESP clients

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// RESP2 value types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple strings: +OK\r\n
    SimpleString(String),

    /// Errors: -Error message\r\n
    Error(String),

    /// Integers: :1000\r\n
    Integer(i64),

    /// Bulk strings: $6\r\nfoobar\r\n
    BulkString(Bytes),

    /// Null bulk string: $-1\r\n
    Null,

    /// Arrays: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Create a simple string
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Create an error
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Create an integer
    pub fn integer(i: i64) -> Self {
        RespValue::Integer(i)
    }

    /// Create a bulk string from bytes
    pub fn bulk_string(b: impl Into<Bytes>) -> Self {
        RespValue::BulkString(b.into())
    }

    /// Create a null value
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Create an array
    pub fn array(v: Vec<RespValue>) -> Self {
        RespValue::Array(v)
    }

    /// The `+OK` status reply
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Check if this is an error reply
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Flatten a client request (an array of bulk strings) into its parts
    ///
    /// Returns `None` when the value is not a non-empty array of bulk strings.
    /// Integers are accepted and rendered in decimal, as some clients send them.
    pub fn into_command_parts(self) -> Option<Vec<Bytes>> {
        let parts = match self {
            RespValue::Array(parts) if !parts.is_empty() => parts,
            _ => return None,
        };

        parts
            .into_iter()
            .map(|part| match part {
                RespValue::BulkString(b) => Some(b),
                RespValue::SimpleString(s) => Some(Bytes::from(s)),
                RespValue::Integer(i) => Some(Bytes::from(i.to_string())),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "SimpleString({})", s),
            RespValue::Error(e) => write!(f, "Error({})", e),
            RespValue::Integer(i) => write!(f, "Integer({})", i),
            RespValue::BulkString(b) => write!(f, "BulkString({} bytes)", b.len()),
            RespValue::Null => write!(f, "Null"),
            RespValue::Array(arr) => write!(f, "Array({} elements)", arr.len()),
        }
    }
}

/// RESP framing errors
///
/// A frame that does not parse poisons the rest of the stream, so the
/// connection answers with one error and closes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RespError {
    #[error("{0}")]
    InvalidProtocol(String),

    #[error("invalid UTF-8 in frame header")]
    InvalidUtf8,

    #[error("length out of range")]
    IntegerOverflow,

    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for RespError {
    fn from(e: std::io::Error) -> Self {
        RespError::IoError(e.to_string())
    }
}
