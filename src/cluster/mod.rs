//! Cluster and sharding module
//!
//! The keyspace is split across a fixed set of shards, each running in its own
//! thread with a private store, lock table and transaction queue. `ShardSet`
//! owns the shards and offers the fan-out primitives used by the transaction
//! coordinator and by diagnostics.

mod lock;
mod router;
mod shard;
mod txq;

pub use lock::{Acquire, LockMode, LockRequest, LockTable, LockTarget};
pub use router::KeyRouter;
pub use shard::{EngineShard, Shard, ShardCounters, ShardMessage};
pub use txq::{Footprint, TxQueue};

use crate::config::ShardSetConfig;
use crate::error::TxError;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::info;

/// Index of a shard, fixed for the process lifetime
pub type ShardId = usize;

/// Transaction identity, increasing in scheduling order
pub type TxId = u64;

/// Owns every shard; immutable once built
pub struct ShardSet {
    shards: Vec<Shard>,
    router: KeyRouter,
}

impl ShardSet {
    /// Start `config.num_shards` shard threads
    pub fn new(config: &ShardSetConfig) -> anyhow::Result<Self> {
        info!("Initializing shard set with {} shards", config.num_shards);

        let router = KeyRouter::new(config.num_shards, config.lock_on_hashtags);
        let shards = (0..config.num_shards)
            .map(Shard::spawn)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ShardSet { shards, router })
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    pub fn shard_for(&self, key: &[u8]) -> ShardId {
        self.router.shard_for(key)
    }

    pub(crate) fn send(&self, shard: ShardId, message: ShardMessage) -> Result<(), TxError> {
        self.shards
            .get(shard)
            .ok_or(TxError::ShardUnavailable(shard))?
            .send(message)
    }

    /// Run `f` on one shard's thread and return its result
    pub async fn run_on<F, R>(&self, shard: ShardId, f: F) -> Result<R, TxError>
    where
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(
            shard,
            ShardMessage::Brief(Box::new(move |engine| {
                let _ = reply.send(f(engine));
            })),
        )?;
        rx.await.map_err(|_| TxError::NoResponse(shard))
    }

    /// Run `f` once on every shard, each inside its own loop; returns after
    /// all of them finished, results ordered by shard
    pub async fn run_on_all<F, R>(&self, f: F) -> Result<Vec<R>, TxError>
    where
        F: Fn(&mut EngineShard) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let f = Arc::new(f);
        let mut receivers = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (reply, rx) = oneshot::channel();
            let f = f.clone();
            shard.send(ShardMessage::Brief(Box::new(move |engine| {
                let _ = reply.send(f(engine));
            })))?;
            receivers.push((shard.id(), rx));
        }

        let mut results = Vec::with_capacity(receivers.len());
        for (id, rx) in receivers {
            results.push(rx.await.map_err(|_| TxError::NoResponse(id))?);
        }
        Ok(results)
    }

    /// True if any shard's lock table holds at least one entry
    pub async fn is_any_shard_locked(&self) -> Result<bool, TxError> {
        let locked = self.run_on_all(|engine| !engine.locks().is_empty()).await?;
        Ok(locked.into_iter().any(|l| l))
    }

    /// True if `key` is locked on `shard`
    pub async fn is_locked(&self, shard: ShardId, key: &[u8]) -> Result<bool, TxError> {
        let key = Bytes::copy_from_slice(key);
        self.run_on(shard, move |engine| engine.locks().is_locked(&key)).await
    }

    /// Length of every shard's transaction queue
    pub async fn txq_lengths(&self) -> Result<Vec<usize>, TxError> {
        self.run_on_all(|engine| engine.txq().len()).await
    }

    /// Detailed statistics for each shard
    pub async fn shard_stats(&self) -> Result<Vec<ShardStats>, TxError> {
        self.run_on_all(|engine| {
            let store = engine.store().stats();
            let counters = engine.counters();
            ShardStats {
                shard_id: engine.id(),
                keys: store.keys,
                memory_bytes: store.used_memory_bytes,
                txq_len: engine.txq().len(),
                lock_entries: engine.locks().len(),
                active_transactions: engine.active_transactions(),
                ooo_hops: counters.ooo_hops,
                queued_hops: counters.queued_hops,
                demotions: counters.demotions,
            }
        })
        .await
    }
}

/// Statistics for a single shard
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub keys: usize,
    pub memory_bytes: usize,
    pub txq_len: usize,
    pub lock_entries: usize,
    pub active_transactions: usize,
    pub ooo_hops: u64,
    pub queued_hops: u64,
    pub demotions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;

    fn config(num_shards: usize) -> ShardSetConfig {
        ShardSetConfig {
            num_shards,
            lock_on_hashtags: false,
        }
    }

    #[tokio::test]
    async fn test_run_on_all_visits_every_shard() {
        let set = ShardSet::new(&config(4)).unwrap();
        let ids = set.run_on_all(|engine| engine.id()).await.unwrap();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_run_on_mutates_shard_store() {
        let set = ShardSet::new(&config(2)).unwrap();
        set.run_on(1, |engine| {
            engine.store_mut().set("k", Value::integer(5));
        })
        .await
        .unwrap();

        let sizes = set.run_on_all(|engine| engine.store().len()).await.unwrap();
        assert_eq!(sizes, vec![0, 1]);
        assert!(!set.is_any_shard_locked().await.unwrap());
        assert_eq!(set.txq_lengths().await.unwrap(), vec![0, 0]);
    }
}
