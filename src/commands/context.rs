//! Command execution context

use crate::cluster::ShardId;
use crate::store::MemoryStore;

/// Context handed to a command while it runs inside a transaction hop
///
/// Only ever built by the owning shard thread, so the store borrow is
/// exclusive for the duration of the hop.
pub struct CommandContext<'a> {
    /// Shard the hop is running on
    pub shard_id: ShardId,

    /// This shard's partition of the keyspace
    pub store: &'a mut MemoryStore,
}

impl<'a> CommandContext<'a> {
    /// Create a new command context
    pub fn new(shard_id: ShardId, store: &'a mut MemoryStore) -> Self {
        CommandContext { shard_id, store }
    }
}
