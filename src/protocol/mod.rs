//! Wire protocols
//!
//! RESP2 for Redis clients and the memcached text protocol. Both are framed
//! with `tokio_util` codecs and are independent from the storage and
//! transaction layers: they only produce parsed requests and encode replies.

mod types;
mod resp;
mod memcache;

pub use types::{RespValue, RespError};
pub use resp::{RespParser, RespEncoder, RespCodec};
pub use memcache::{McCommand, McReply, McStoreMode, McValue, MemcacheCodec, MemcacheError};
