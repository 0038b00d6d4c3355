//! In-memory storage module
//!
//! Each shard owns one `MemoryStore` holding the subset of the keyspace routed
//! to it. The store is only ever touched from its shard's own thread, so it
//! needs no internal locking.

mod entry;
mod value;
mod memory;

pub use entry::Entry;
pub use value::Value;
pub use memory::{MemoryStore, StoreStats};
