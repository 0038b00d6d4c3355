//! Transactions and the multi-hop protocol
//!
//! A transaction declares its keys before it is admitted. From the key-set the
//! router derives the participating shards and, per shard, the intent locks to
//! request. Execution then proceeds in hops: the coordinator installs a
//! closure, arms every participating shard and waits until all of them ran it.
//!
//! Everything a shard thread touches here is either immutable after
//! scheduling or atomic; the closure slot sits behind a mutex that is only
//! written while no hop is in flight.

mod scheduler;

pub use scheduler::{TxHandle, TxScheduler};

use crate::cluster::{Footprint, KeyRouter, LockMode, LockRequest, ShardId, TxId};
use crate::commands::CommandContext;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shard-local body of one hop
pub type HopFn = Arc<dyn Fn(&mut CommandContext<'_>) + Send + Sync>;

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxState {
    /// Built, not registered on any shard yet
    Pending = 0,
    /// Registered on every participating shard, waiting for its first hop
    Armed = 1,
    Executing = 2,
    Done = 3,
    /// Rejected before registration
    Aborted = 4,
}

impl TxState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TxState::Pending,
            1 => TxState::Armed,
            2 => TxState::Executing,
            3 => TxState::Done,
            _ => TxState::Aborted,
        }
    }
}

/// The declared keys of a transaction with the strongest mode each is used in
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<(Bytes, LockMode)>,
    global: bool,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A key-set covering every shard exclusively (FLUSHDB, KEYS...)
    pub fn global() -> Self {
        KeySet {
            keys: Vec::new(),
            global: true,
        }
    }

    /// Declare `key`; an exclusive use wins over a shared one
    pub fn add(&mut self, key: Bytes, mode: LockMode) {
        match self.keys.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => {
                if mode == LockMode::Exclusive {
                    *existing = LockMode::Exclusive;
                }
            }
            None => self.keys.push((key, mode)),
        }
    }

    pub fn set_global(&mut self) {
        self.global = true;
    }

    /// Fold `other` into this set
    pub fn merge(&mut self, other: KeySet) {
        self.global |= other.global;
        for (key, mode) in other.keys {
            self.add(key, mode);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.keys.iter().any(|(k, _)| k.as_ref() == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.keys.iter().map(|(k, _)| k)
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    /// True if the set touches no shard at all
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && !self.global
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// What a transaction needs on one participating shard
#[derive(Debug, Clone)]
pub struct ShardPart {
    pub shard: ShardId,
    pub locks: Vec<LockRequest>,
    pub keys: Vec<Bytes>,
}

struct Hop {
    run: HopFn,
    conclude: bool,
}

/// One coordinated execution unit, shared between the coordinator and the
/// shard threads it participates in
pub struct Transaction {
    id: AtomicU64,
    parts: Vec<ShardPart>,
    global: bool,
    state: AtomicU8,
    ooo: AtomicBool,
    ooo_vetoed: AtomicBool,
    hops: AtomicU32,
    pending: AtomicUsize,
    barrier: Notify,
    hop: Mutex<Option<Hop>>,
}

impl Transaction {
    /// Build a transaction for `keys`; the id is assigned when it is scheduled
    pub(crate) fn new(keys: &KeySet, router: &KeyRouter) -> Self {
        let parts = if keys.is_global() {
            (0..router.num_shards())
                .map(|shard| ShardPart {
                    shard,
                    locks: vec![LockRequest::shard(LockMode::Exclusive)],
                    keys: Vec::new(),
                })
                .collect()
        } else {
            let mut parts: Vec<ShardPart> = Vec::new();
            for shard in router.shards_for(keys.keys()) {
                parts.push(ShardPart {
                    shard,
                    locks: vec![LockRequest::shard(LockMode::Shared)],
                    keys: Vec::new(),
                });
            }
            for (key, mode) in &keys.keys {
                let shard = router.shard_for(key);
                if let Ok(idx) = parts.binary_search_by_key(&shard, |p| p.shard) {
                    parts[idx].locks.push(LockRequest::key(key.clone(), *mode));
                    parts[idx].keys.push(key.clone());
                }
            }
            parts
        };

        Transaction {
            id: AtomicU64::new(0),
            parts,
            global: keys.is_global(),
            state: AtomicU8::new(TxState::Pending as u8),
            ooo: AtomicBool::new(false),
            ooo_vetoed: AtomicBool::new(false),
            hops: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
            barrier: Notify::new(),
            hop: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TxId {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn assign_id(&self, id: TxId) {
        self.id.store(id, Ordering::Release);
    }

    /// Participating shards, ascending
    pub fn parts(&self) -> &[ShardPart] {
        &self.parts
    }

    pub fn part(&self, shard: ShardId) -> Option<&ShardPart> {
        self.parts
            .binary_search_by_key(&shard, |p| p.shard)
            .ok()
            .map(|idx| &self.parts[idx])
    }

    pub fn shard_count(&self) -> usize {
        self.parts.len()
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    /// How a queue entry for this transaction conflicts on `shard`
    pub(crate) fn footprint(&self, shard: ShardId) -> Footprint {
        if self.global {
            return Footprint::All;
        }
        Footprint::Keys(self.part(shard).map(|p| p.keys.clone()).unwrap_or_default())
    }

    pub fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TxState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the transaction bypasses the shard queues
    pub fn is_ooo(&self) -> bool {
        self.ooo.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ooo(&self) {
        self.ooo.store(true, Ordering::Release);
    }

    /// Called by a shard that could not admit the transaction out of order
    pub(crate) fn veto_ooo(&self) {
        self.ooo_vetoed.store(true, Ordering::Release);
    }

    pub(crate) fn ooo_vetoed(&self) -> bool {
        self.ooo_vetoed.load(Ordering::Acquire)
    }

    /// Number of hops dispatched so far
    pub fn hops(&self) -> u32 {
        self.hops.load(Ordering::Acquire)
    }

    pub(crate) fn install_hop(&self, run: HopFn, conclude: bool) {
        self.hops.fetch_add(1, Ordering::AcqRel);
        *self.hop.lock() = Some(Hop { run, conclude });
    }

    /// The hop shards should run now, and whether it is the last one
    pub(crate) fn current_hop(&self) -> Option<(HopFn, bool)> {
        self.hop
            .lock()
            .as_ref()
            .map(|hop| (hop.run.clone(), hop.conclude))
    }

    /// Expect `n` acknowledgements before the barrier opens
    pub(crate) fn start_barrier(&self, n: usize) {
        self.pending.store(n, Ordering::Release);
    }

    /// One shard finished its part of the current phase
    pub(crate) fn ack(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.barrier.notify_one();
        }
    }

    pub(crate) async fn wait_barrier(&self) {
        loop {
            let notified = self.barrier.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("shards", &self.parts.iter().map(|p| p.shard).collect::<Vec<_>>())
            .field("global", &self.global)
            .field("state", &self.state())
            .field("ooo", &self.is_ooo())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyset_upgrades_mode() {
        let mut keys = KeySet::new();
        keys.add(Bytes::from("a"), LockMode::Shared);
        keys.add(Bytes::from("a"), LockMode::Exclusive);
        keys.add(Bytes::from("a"), LockMode::Shared);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.keys[0].1, LockMode::Exclusive);
        assert!(keys.contains(b"a"));
        assert!(!keys.contains(b"b"));
    }

    #[test]
    fn test_parts_follow_router() {
        let router = KeyRouter::new(4, false);
        let mut keys = KeySet::new();
        for i in 0..16 {
            keys.add(Bytes::from(format!("key{}", i)), LockMode::Exclusive);
        }
        let tx = Transaction::new(&keys, &router);

        assert!(tx.parts().windows(2).all(|w| w[0].shard < w[1].shard));
        for part in tx.parts() {
            assert_eq!(part.locks[0], LockRequest::shard(LockMode::Shared));
            assert_eq!(part.locks.len(), part.keys.len() + 1);
            assert!(part.keys.iter().all(|k| router.shard_for(k) == part.shard));
        }
        let total: usize = tx.parts().iter().map(|p| p.keys.len()).sum();
        assert_eq!(total, 16);
    }

    #[test]
    fn test_global_parts() {
        let router = KeyRouter::new(3, false);
        let tx = Transaction::new(&KeySet::global(), &router);
        assert_eq!(tx.shard_count(), 3);
        assert!(tx
            .parts()
            .iter()
            .all(|p| p.locks == vec![LockRequest::shard(LockMode::Exclusive)]));
        assert_eq!(tx.footprint(1), Footprint::All);
        assert!(tx.parts().iter().all(|p| p.keys.is_empty()));
    }

    #[tokio::test]
    async fn test_barrier_opens_after_all_acks() {
        let router = KeyRouter::new(1, false);
        let tx = Arc::new(Transaction::new(&KeySet::new(), &router));
        tx.start_barrier(3);

        let acker = tx.clone();
        let handle = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::task::yield_now().await;
                acker.ack();
            }
        });
        tx.wait_barrier().await;
        handle.await.unwrap();
        assert_eq!(tx.pending.load(Ordering::Acquire), 0);
    }
}
