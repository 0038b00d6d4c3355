//! Error types
//!
//! Contention is never an error: a transaction that cannot get its locks is
//! simply queued. What remains are admission failures (reported to the client
//! before anything is registered), shard-set failures during shutdown, and
//! configuration problems at startup.

use crate::cluster::{ShardId, TxId};
use bytes::Bytes;
use thiserror::Error;

/// Transaction coordination errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// The shard thread is gone (process shutting down)
    #[error("shard {0} is not running")]
    ShardUnavailable(ShardId),

    /// A shard dropped a reply channel without answering
    #[error("shard {0} did not respond")]
    NoResponse(ShardId),

    /// A hop was requested after the final one
    #[error("transaction {0} already concluded")]
    Concluded(TxId),
}

/// Errors raised while loading or running a script
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Error compiling script: {0}")]
    Compile(String),

    #[error("script tried accessing undeclared key: {}", String::from_utf8_lossy(.0))]
    UndeclaredKey(Bytes),

    #[error("This Redis command is not allowed from scripts")]
    NotAllowed,

    #[error("Unknown Redis command called from script")]
    UnknownCommand,

    #[error("Wrong number of args calling Redis command from script")]
    WrongArity,

    /// An error reply raised by `redis.call`
    #[error("{0}")]
    Reply(String),

    #[error("{0}")]
    Tx(#[from] TxError),
}

impl ScriptError {
    /// The error line sent back to a RESP client
    pub fn to_reply(&self) -> String {
        match self {
            ScriptError::Reply(msg) => msg.clone(),
            other => format!("ERR {}", other),
        }
    }
}

/// Startup configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_replies() {
        let err = ScriptError::UndeclaredKey(Bytes::from("bar"));
        assert_eq!(err.to_reply(), "ERR script tried accessing undeclared key: bar");

        let err = ScriptError::Reply("WRONGTYPE Operation against a key".to_string());
        assert_eq!(err.to_reply(), "WRONGTYPE Operation against a key");
    }

    #[test]
    fn test_tx_error_display() {
        assert_eq!(TxError::ShardUnavailable(3).to_string(), "shard 3 is not running");
    }
}
