//! Per-shard intent locks
//!
//! Locks never block the shard thread. A request that cannot be granted is
//! appended to the entry's wait list and the owning transaction simply stays
//! unrunnable until `release` promotes it.
//!
//! Grants follow strict arrival order: a request is only granted on the spot
//! when it is compatible with the holders *and* nobody is waiting. Combined
//! with the id-ordered transaction queues this means a transaction only ever
//! waits for older ones, so the waits-for graph has no cycles.

use super::TxId;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn compatible(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }
}

/// What a lock protects
///
/// `Shard` is the shard-wide intent lock: keyed transactions take it shared,
/// global transactions (FLUSHDB and friends) take it exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Shard,
    Key(Bytes),
}

/// One lock a transaction needs on a shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub target: LockTarget,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn key(key: Bytes, mode: LockMode) -> Self {
        LockRequest { target: LockTarget::Key(key), mode }
    }

    pub fn shard(mode: LockMode) -> Self {
        LockRequest { target: LockTarget::Shard, mode }
    }
}

/// Outcome of `try_acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Queued,
}

#[derive(Debug)]
struct LockEntry {
    mode: LockMode,
    holders: Vec<TxId>,
    waiters: VecDeque<(TxId, LockMode)>,
}

/// Lock table of one shard
#[derive(Debug, Default)]
pub struct LockTable {
    entries: HashMap<LockTarget, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `target` in `mode` on behalf of `tx`
    pub fn try_acquire(&mut self, target: LockTarget, mode: LockMode, tx: TxId) -> Acquire {
        let entry = match self.entries.get_mut(&target) {
            Some(entry) => entry,
            None => {
                self.entries.insert(
                    target,
                    LockEntry {
                        mode,
                        holders: vec![tx],
                        waiters: VecDeque::new(),
                    },
                );
                return Acquire::Granted;
            }
        };

        if entry.holders.contains(&tx) {
            // Re-entrant request: shared on top of anything held is a no-op,
            // an upgrade is only possible for a sole holder.
            if mode == LockMode::Shared || entry.mode == LockMode::Exclusive {
                return Acquire::Granted;
            }
            if entry.holders.len() == 1 {
                entry.mode = LockMode::Exclusive;
                return Acquire::Granted;
            }
        } else if entry.waiters.is_empty()
            && (entry.holders.is_empty() || entry.mode.compatible(mode))
        {
            if entry.holders.is_empty() {
                entry.mode = mode;
            }
            entry.holders.push(tx);
            return Acquire::Granted;
        }

        entry.waiters.push_back((tx, mode));
        Acquire::Queued
    }

    /// Drop every hold and wait `tx` has on `target`
    ///
    /// Returns the transactions promoted from the wait list: a batch of shared
    /// waiters up to the first exclusive one, or a single exclusive waiter.
    pub fn release(&mut self, target: &LockTarget, tx: TxId) -> Vec<TxId> {
        let entry = match self.entries.get_mut(target) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        entry.holders.retain(|&holder| holder != tx);
        entry.waiters.retain(|&(waiter, _)| waiter != tx);

        let mut promoted = Vec::new();
        while let Some(&(waiter, mode)) = entry.waiters.front() {
            let grantable = entry.holders.is_empty()
                || entry.holders == [waiter]
                || entry.mode.compatible(mode);
            if !grantable {
                break;
            }
            entry.waiters.pop_front();
            entry.mode = mode;
            if !entry.holders.contains(&waiter) {
                entry.holders.push(waiter);
            }
            promoted.push(waiter);
            if mode == LockMode::Exclusive {
                break;
            }
        }

        if entry.holders.is_empty() && entry.waiters.is_empty() {
            self.entries.remove(target);
        }
        promoted
    }

    /// True if any of `keys` is held by someone other than `tx` or has waiters
    pub fn is_contended<'a, I>(&self, keys: I, tx: TxId) -> bool
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        keys.into_iter().any(|key| {
            match self.entries.get(&LockTarget::Key(key.clone())) {
                Some(entry) => {
                    !entry.waiters.is_empty() || entry.holders.iter().any(|&h| h != tx)
                }
                None => false,
            }
        })
    }

    /// True if `key` has any holder or waiter
    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.entries
            .contains_key(&LockTarget::Key(Bytes::copy_from_slice(key)))
    }

    /// Current mode of `target`, if anyone holds it
    pub fn mode(&self, target: &LockTarget) -> Option<LockMode> {
        self.entries
            .get(target)
            .filter(|entry| !entry.holders.is_empty())
            .map(|entry| entry.mode)
    }

    /// Number of live entries (keys plus the shard intent)
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

    fn key(k: &str) -> LockTarget {
        LockTarget::Key(Bytes::copy_from_slice(k.as_bytes()))
    }

    #[test]
    fn test_exclusive_excludes() {
        let mut locks = LockTable::new();
        assert_eq!(locks.try_acquire(key("x"), LockMode::Exclusive, 1), Acquire::Granted);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Exclusive, 2), Acquire::Queued);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Shared, 3), Acquire::Queued);

        assert_eq!(locks.release(&key("x"), 1), vec![2]);
        assert_eq!(locks.mode(&key("x")), Some(LockMode::Exclusive));
        assert_eq!(locks.release(&key("x"), 2), vec![3]);
        assert_eq!(locks.release(&key("x"), 3), Vec::<TxId>::new());
        assert!(locks.is_empty());
    }

    #[test]
    fn test_shared_coexist() {
        let mut locks = LockTable::new();
        assert_eq!(locks.try_acquire(key("x"), LockMode::Shared, 1), Acquire::Granted);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Shared, 2), Acquire::Granted);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Exclusive, 3), Acquire::Queued);

        assert!(locks.release(&key("x"), 1).is_empty());
        assert_eq!(locks.release(&key("x"), 2), vec![3]);
    }

    #[test]
    fn test_shared_after_waiting_exclusive_queues() {
        // arrival order wins: a shared request does not jump a queued writer
        let mut locks = LockTable::new();
        locks.try_acquire(key("x"), LockMode::Shared, 1);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Exclusive, 2), Acquire::Queued);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Shared, 3), Acquire::Queued);

        assert_eq!(locks.release(&key("x"), 1), vec![2]);
        assert_eq!(locks.release(&key("x"), 2), vec![3]);
    }

    #[test]
    fn test_shared_batch_promotion_stops_at_exclusive() {
        let mut locks = LockTable::new();
        locks.try_acquire(key("x"), LockMode::Exclusive, 1);
        locks.try_acquire(key("x"), LockMode::Shared, 2);
        locks.try_acquire(key("x"), LockMode::Shared, 3);
        locks.try_acquire(key("x"), LockMode::Exclusive, 4);
        locks.try_acquire(key("x"), LockMode::Shared, 5);

        assert_eq!(locks.release(&key("x"), 1), vec![2, 3]);
        assert_eq!(locks.mode(&key("x")), Some(LockMode::Shared));
        assert!(locks.release(&key("x"), 2).is_empty());
        assert_eq!(locks.release(&key("x"), 3), vec![4]);
        assert_eq!(locks.release(&key("x"), 4), vec![5]);
    }

    #[test]
    fn test_reentrant() {
        let mut locks = LockTable::new();
        assert_eq!(locks.try_acquire(key("x"), LockMode::Shared, 1), Acquire::Granted);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Exclusive, 1), Acquire::Granted);
        assert_eq!(locks.mode(&key("x")), Some(LockMode::Exclusive));
        assert_eq!(locks.try_acquire(key("x"), LockMode::Shared, 1), Acquire::Granted);
        assert!(locks.release(&key("x"), 1).is_empty());
        assert!(locks.is_empty());
    }

    #[test]
    fn test_contention() {
        let mut locks = LockTable::new();
        let x = Bytes::from("x");
        let y = Bytes::from("y");

        assert!(!locks.is_contended([&x, &y], 7));
        locks.try_acquire(key("x"), LockMode::Shared, 7);
        assert!(!locks.is_contended([&x], 7));
        assert!(locks.is_contended([&x], 8));

        locks.try_acquire(key("x"), LockMode::Exclusive, 9);
        assert!(locks.is_contended([&x], 7));
        assert!(locks.is_locked(b"x"));
        assert!(!locks.is_locked(b"y"));
    }

    #[test]
    fn test_release_of_waiter_only() {
        let mut locks = LockTable::new();
        locks.try_acquire(key("x"), LockMode::Exclusive, 1);
        locks.try_acquire(key("x"), LockMode::Exclusive, 2);
        assert!(locks.release(&key("x"), 2).is_empty());
        assert!(locks.release(&key("x"), 1).is_empty());
        assert!(locks.is_empty());
    }

    #[test]
    fn test_shard_intent_independent_of_keys() {
        let mut locks = LockTable::new();
        locks.try_acquire(LockTarget::Shard, LockMode::Shared, 1);
        assert_eq!(locks.try_acquire(LockTarget::Shard, LockMode::Exclusive, 2), Acquire::Queued);
        assert_eq!(locks.try_acquire(key("x"), LockMode::Exclusive, 2), Acquire::Granted);
        assert!(!locks.is_locked(b"y"));
        assert_eq!(locks.len(), 2);
    }
}
