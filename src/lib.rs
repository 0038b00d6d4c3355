//! hopdb - an in-memory key-value store with per-core shards
//!
//! The keyspace is partitioned across shard threads. Every request runs as a
//! transaction that is registered on the shards owning its keys and executed
//! in one or more hops; the shards' lock tables and id-ordered transaction
//! queues keep concurrent multi-key transactions serializable.
//!
//! - `cluster`: shards, key routing, lock tables, transaction queues
//! - `transaction`: scheduling and the multi-hop coordinator
//! - `commands`: shard-local command logic and reply merging
//! - `dispatch`: per-connection state, MULTI/EXEC, scripts, memcached
//! - `protocol`, `server`, `web`: the outer surfaces

pub mod cluster;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod scripting;
pub mod server;
pub mod store;
pub mod transaction;
pub mod web;

/// Re-export commonly used types
pub use cluster::{KeyRouter, ShardSet};
pub use config::{ServerConfig, ShardSetConfig};
pub use dispatch::{ConnectionContext, DebugInfo, Service};
pub use protocol::{RespError, RespValue};
pub use store::{Entry, MemoryStore};
