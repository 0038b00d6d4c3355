//! Per-shard transaction queue
//!
//! Ordered by transaction id. Ids are handed out and schedule messages are
//! sent under one lock, so id order is also the arrival order on every shard;
//! keeping the queue sorted lets a demoted out-of-order transaction slide back
//! into the position it would have had.

use super::TxId;
use bytes::Bytes;
use std::collections::BTreeMap;

/// The keys a queued transaction touches on this shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Footprint {
    /// Whole-shard transaction, conflicts with everything
    All,
    Keys(Vec<Bytes>),
}

impl Footprint {
    fn intersects(&self, keys: &[Bytes]) -> bool {
        match self {
            Footprint::All => true,
            Footprint::Keys(own) => own.iter().any(|k| keys.contains(k)),
        }
    }
}

#[derive(Debug, Default)]
pub struct TxQueue {
    entries: BTreeMap<TxId, Footprint>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx: TxId, footprint: Footprint) {
        self.entries.insert(tx, footprint);
    }

    pub fn remove(&mut self, tx: TxId) -> bool {
        self.entries.remove(&tx).is_some()
    }

    /// Oldest queued transaction
    pub fn head(&self) -> Option<TxId> {
        self.entries.keys().next().copied()
    }

    pub fn contains(&self, tx: TxId) -> bool {
        self.entries.contains_key(&tx)
    }

    /// Does any queued transaction touch one of `keys`?
    ///
    /// `global` callers touch the whole shard and intersect any entry.
    pub fn intersects(&self, keys: &[Bytes], global: bool) -> bool {
        if global {
            return !self.entries.is_empty();
        }
        self.entries.values().any(|fp| fp.intersects(keys))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(ks: &[&str]) -> Vec<Bytes> {
        ks.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())).collect()
    }

    #[test]
    fn test_head_is_lowest_id() {
        let mut q = TxQueue::new();
        q.insert(7, Footprint::Keys(keys(&["a"])));
        q.insert(3, Footprint::Keys(keys(&["b"])));
        assert_eq!(q.head(), Some(3));

        assert!(q.remove(3));
        assert!(!q.remove(3));
        assert_eq!(q.head(), Some(7));
    }

    #[test]
    fn test_intersection() {
        let mut q = TxQueue::new();
        assert!(!q.intersects(&keys(&["a"]), false));
        assert!(!q.intersects(&[], true));

        q.insert(1, Footprint::Keys(keys(&["a", "b"])));
        assert!(q.intersects(&keys(&["b", "z"]), false));
        assert!(!q.intersects(&keys(&["z"]), false));
        assert!(q.intersects(&[], true));

        q.insert(2, Footprint::All);
        assert!(q.intersects(&keys(&["z"]), false));
    }
}
