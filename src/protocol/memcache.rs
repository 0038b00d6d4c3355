//! memcached text protocol
//!
//! Only the commands that map onto a plain string store are supported:
//! storage (`set`/`add`/`replace`/`append`/`prepend`), retrieval
//! (`get`/`gets`), `delete`, `incr`/`decr`, `flush_all`, `version`, `quit`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const MAX_KEY_LEN: usize = 250;
const MAX_LINE_LEN: usize = 8 * 1024;
/// Largest accepted data block (memcached's default item size limit)
const MAX_DATA_LEN: usize = 1024 * 1024;

/// How a storage command treats an existing (or missing) key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McStoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// A parsed memcached request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McCommand {
    Store {
        mode: McStoreMode,
        key: Bytes,
        flags: u32,
        exptime: i64,
        data: Bytes,
        noreply: bool,
    },
    Get {
        keys: Vec<Bytes>,
        with_cas: bool,
    },
    Delete {
        key: Bytes,
        noreply: bool,
    },
    Incr {
        key: Bytes,
        delta: u64,
        decr: bool,
        noreply: bool,
    },
    FlushAll {
        noreply: bool,
    },
    Version,
    Quit,
}

impl McCommand {
    /// Whether the client asked not to receive a reply
    pub fn noreply(&self) -> bool {
        match self {
            McCommand::Store { noreply, .. }
            | McCommand::Delete { noreply, .. }
            | McCommand::Incr { noreply, .. }
            | McCommand::FlushAll { noreply } => *noreply,
            _ => false,
        }
    }
}

/// One item of a `get` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McValue {
    pub key: Bytes,
    pub flags: u32,
    pub data: Bytes,
    pub cas: Option<u64>,
}

/// A memcached reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McReply {
    Stored,
    NotStored,
    Values(Vec<McValue>),
    Deleted,
    NotFound,
    Number(u64),
    Ok,
    Version(String),
    Error,
    ClientError(String),
    ServerError(String),
}

/// Request-level failures; they are answered, never fatal to the connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemcacheError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("bad command line format")]
    BadFormat,
    #[error("bad data chunk")]
    BadDataChunk,
    #[error("key too long")]
    KeyTooLong,
    #[error("object too large for cache")]
    TooLarge,
}

impl From<MemcacheError> for McReply {
    fn from(e: MemcacheError) -> Self {
        match e {
            MemcacheError::UnknownCommand => McReply::Error,
            other => McReply::ClientError(other.to_string()),
        }
    }
}

/// Frames a byte stream into memcached requests
#[derive(Debug, Default, Clone, Copy)]
pub struct MemcacheCodec;

impl MemcacheCodec {
    fn parse_line(line: &[u8], src: &[u8]) -> Option<(Result<McCommand, MemcacheError>, usize)> {
        let text = match std::str::from_utf8(line) {
            Ok(t) => t,
            Err(_) => return Some((Err(MemcacheError::BadFormat), 0)),
        };
        let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
        let name = match tokens.first() {
            Some(n) => n.to_ascii_lowercase(),
            None => return Some((Err(MemcacheError::UnknownCommand), 0)),
        };

        let mode = match name.as_str() {
            "set" => Some(McStoreMode::Set),
            "add" => Some(McStoreMode::Add),
            "replace" => Some(McStoreMode::Replace),
            "append" => Some(McStoreMode::Append),
            "prepend" => Some(McStoreMode::Prepend),
            _ => None,
        };
        if let Some(mode) = mode {
            return Self::parse_store(mode, &tokens, src);
        }

        let cmd = match name.as_str() {
            "get" | "gets" => {
                if tokens.len() < 2 {
                    return Some((Err(MemcacheError::BadFormat), 0));
                }
                let keys: Result<Vec<Bytes>, MemcacheError> =
                    tokens[1..].iter().map(|k| parse_key(k)).collect();
                keys.map(|keys| McCommand::Get {
                    keys,
                    with_cas: name == "gets",
                })
            }
            "delete" => match tokens.len() {
                2 | 3 => parse_key(tokens[1]).map(|key| McCommand::Delete {
                    key,
                    noreply: tokens.get(2) == Some(&"noreply"),
                }),
                _ => Err(MemcacheError::BadFormat),
            },
            "incr" | "decr" => match tokens.len() {
                3 | 4 => match (parse_key(tokens[1]), tokens[2].parse::<u64>()) {
                    (Ok(key), Ok(delta)) => Ok(McCommand::Incr {
                        key,
                        delta,
                        decr: name == "decr",
                        noreply: tokens.get(3) == Some(&"noreply"),
                    }),
                    (Err(e), _) => Err(e),
                    (_, Err(_)) => Err(MemcacheError::BadFormat),
                },
                _ => Err(MemcacheError::BadFormat),
            },
            "flush_all" => Ok(McCommand::FlushAll {
                noreply: tokens.last() == Some(&"noreply"),
            }),
            "version" => Ok(McCommand::Version),
            "quit" => Ok(McCommand::Quit),
            _ => Err(MemcacheError::UnknownCommand),
        };
        Some((cmd, 0))
    }

    /// Parse `<cmd> <key> <flags> <exptime> <bytes> [noreply]` and its data block
    ///
    /// `src` starts right after the command line. Returns `None` when the data
    /// block is not fully buffered yet, otherwise the command and the number of
    /// data bytes consumed.
    fn parse_store(
        mode: McStoreMode,
        tokens: &[&str],
        src: &[u8],
    ) -> Option<(Result<McCommand, MemcacheError>, usize)> {
        if tokens.len() != 5 && tokens.len() != 6 {
            return Some((Err(MemcacheError::BadFormat), 0));
        }
        let header = (
            parse_key(tokens[1]),
            tokens[2].parse::<u32>(),
            tokens[3].parse::<i64>(),
            tokens[4].parse::<usize>(),
        );
        let (key, flags, exptime, len) = match header {
            (Ok(k), Ok(f), Ok(e), Ok(l)) => (k, f, e, l),
            (Err(e), ..) => return Some((Err(e), 0)),
            _ => return Some((Err(MemcacheError::BadFormat), 0)),
        };

        let end = match len.checked_add(2) {
            Some(end) if len <= MAX_DATA_LEN => end,
            _ => return Some((Err(MemcacheError::TooLarge), 0)),
        };
        if src.len() < end {
            return None;
        }
        if &src[len..end] != CRLF {
            return Some((Err(MemcacheError::BadDataChunk), end));
        }

        let cmd = McCommand::Store {
            mode,
            key,
            flags,
            exptime,
            data: Bytes::copy_from_slice(&src[..len]),
            noreply: tokens.get(5) == Some(&"noreply"),
        };
        Some((Ok(cmd), end))
    }
}

fn parse_key(token: &str) -> Result<Bytes, MemcacheError> {
    if token.len() > MAX_KEY_LEN {
        return Err(MemcacheError::KeyTooLong);
    }
    Ok(Bytes::copy_from_slice(token.as_bytes()))
}

impl Decoder for MemcacheCodec {
    type Item = Result<McCommand, MemcacheError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let line_end = match src.windows(2).position(|w| w == CRLF) {
            Some(idx) => idx,
            None if src.len() > MAX_LINE_LEN => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "memcached command line too long",
                ))
            }
            None => return Ok(None),
        };

        let parsed = {
            let (line, rest) = src.split_at(line_end);
            Self::parse_line(line, &rest[2..])
        };
        match parsed {
            Some((cmd, data_len)) => {
                src.advance(line_end + 2 + data_len);
                Ok(Some(cmd))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<McReply> for MemcacheCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: McReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            McReply::Stored => dst.put_slice(b"STORED\r\n"),
            McReply::NotStored => dst.put_slice(b"NOT_STORED\r\n"),
            McReply::Deleted => dst.put_slice(b"DELETED\r\n"),
            McReply::NotFound => dst.put_slice(b"NOT_FOUND\r\n"),
            McReply::Ok => dst.put_slice(b"OK\r\n"),
            McReply::Error => dst.put_slice(b"ERROR\r\n"),
            McReply::Number(n) => {
                dst.put_slice(n.to_string().as_bytes());
                dst.put_slice(CRLF);
            }
            McReply::Version(v) => {
                dst.put_slice(b"VERSION ");
                dst.put_slice(v.as_bytes());
                dst.put_slice(CRLF);
            }
            McReply::ClientError(msg) => {
                dst.put_slice(b"CLIENT_ERROR ");
                dst.put_slice(msg.as_bytes());
                dst.put_slice(CRLF);
            }
            McReply::ServerError(msg) => {
                dst.put_slice(b"SERVER_ERROR ");
                dst.put_slice(msg.as_bytes());
                dst.put_slice(CRLF);
            }
            McReply::Values(values) => {
                for v in values {
                    dst.put_slice(b"VALUE ");
                    dst.put_slice(&v.key);
                    let header = match v.cas {
                        Some(cas) => format!(" {} {} {}\r\n", v.flags, v.data.len(), cas),
                        None => format!(" {} {}\r\n", v.flags, v.data.len()),
                    };
                    dst.put_slice(header.as_bytes());
                    dst.put_slice(&v.data);
                    dst.put_slice(CRLF);
                }
                dst.put_slice(b"END\r\n");
            }
        }
        Ok(())
    }
}
