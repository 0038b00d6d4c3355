//! Shard implementation
//!
//! Each shard runs in its own thread with a dedicated MemoryStore, lock table
//! and transaction queue. The thread drains one message queue; after every
//! batch of messages it runs whatever transaction hops became runnable.
//!
//! Scheduling rules on one shard:
//! - a transaction parked for out-of-order execution runs as soon as it is
//!   armed, ignoring the queue;
//! - otherwise only the head of the queue may run, once it is armed and all
//!   of its locks are granted.

use super::lock::{Acquire, LockTable};
use super::txq::TxQueue;
use super::{ShardId, TxId};
use crate::commands::CommandContext;
use crate::error::TxError;
use crate::store::MemoryStore;
use crate::transaction::Transaction;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

/// Work sent to a shard thread
pub enum ShardMessage {
    /// Register a transaction. `armed` means its only hop is already
    /// installed and may run as soon as admissible.
    Schedule { tx: Arc<Transaction>, armed: bool },

    /// The coordinator installed the next hop
    Arm(Arc<Transaction>),

    /// Run a closure against the shard state (fan-out and diagnostics)
    Brief(Box<dyn FnOnce(&mut EngineShard) + Send>),
}

/// Handle to a shard thread
pub struct Shard {
    id: ShardId,
    sender: mpsc::UnboundedSender<ShardMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Shard {
    /// Create a new shard and start its thread
    pub fn spawn(id: ShardId) -> anyhow::Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name(format!("shard-{}", id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Shard {} failed to build its runtime: {}", id, e);
                        return;
                    }
                };
                runtime.block_on(Self::run_shard_loop(id, receiver));
            })
            .map_err(|e| anyhow::anyhow!("failed to spawn shard {} thread: {}", id, e))?;

        info!("Shard {} started", id);

        Ok(Shard {
            id,
            sender,
            thread: Some(thread),
        })
    }

    /// Send a message to this shard
    pub fn send(&self, message: ShardMessage) -> Result<(), TxError> {
        self.sender
            .send(message)
            .map_err(|_| TxError::ShardUnavailable(self.id))
    }

    /// The main loop that runs in the shard's thread
    async fn run_shard_loop(id: ShardId, mut receiver: mpsc::UnboundedReceiver<ShardMessage>) {
        let mut shard = EngineShard::new(id);

        while let Some(message) = receiver.recv().await {
            shard.handle(message);
            while let Ok(message) = receiver.try_recv() {
                shard.handle(message);
            }
            shard.poll_execution();
        }

        if !shard.active.is_empty() {
            warn!("Shard {} exiting with {} live transactions", id, shard.active.len());
        }
        info!("Shard {} shutting down", id);
    }

    /// Get shard ID
    pub fn id(&self) -> ShardId {
        self.id
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        // Closing the channel ends the loop; the sender is replaced so it is
        // dropped before joining.
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.sender, closed));
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Shard {} thread panicked", self.id);
            }
        }
    }
}

/// Per-shard bookkeeping of a registered transaction
struct ShardTx {
    tx: Arc<Transaction>,
    /// Lock requests still waiting in the lock table
    locks_pending: usize,
    /// In `txq` (false while parked for out-of-order execution)
    queued: bool,
    /// A hop is installed and has not run here yet
    armed: bool,
    hops_run: u32,
}

/// Counters reported through diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardCounters {
    pub ooo_hops: u64,
    pub queued_hops: u64,
    pub demotions: u64,
}

/// State owned by one shard thread
pub struct EngineShard {
    id: ShardId,
    store: MemoryStore,
    locks: LockTable,
    txq: TxQueue,
    active: HashMap<TxId, ShardTx>,
    ooo_ready: VecDeque<TxId>,
    counters: ShardCounters,
}

impl EngineShard {
    pub fn new(id: ShardId) -> Self {
        EngineShard {
            id,
            store: MemoryStore::new(),
            locks: LockTable::new(),
            txq: TxQueue::new(),
            active: HashMap::new(),
            ooo_ready: VecDeque::new(),
            counters: ShardCounters::default(),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MemoryStore {
        &mut self.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    pub fn counters(&self) -> ShardCounters {
        self.counters
    }

    /// Transactions registered here and not concluded yet
    pub fn active_transactions(&self) -> usize {
        self.active.len()
    }

    pub fn handle(&mut self, message: ShardMessage) {
        match message {
            ShardMessage::Schedule { tx, armed } => self.schedule(tx, armed),
            ShardMessage::Arm(tx) => self.arm(tx),
            ShardMessage::Brief(f) => f(self),
        }
    }

    fn schedule(&mut self, tx: Arc<Transaction>, armed: bool) {
        let id = tx.id();
        let part = match tx.part(self.id) {
            Some(part) => part,
            None => {
                warn!("Shard {}: tx {} scheduled on a shard it does not use", self.id, id);
                tx.veto_ooo();
                tx.ack();
                return;
            }
        };

        let uncontended = !tx.is_global()
            && !self.locks.is_contended(&part.keys, id)
            && !self.txq.intersects(&part.keys, false);

        let mut locks_pending = 0;
        for request in &part.locks {
            if self.locks.try_acquire(request.target.clone(), request.mode, id) == Acquire::Queued {
                locks_pending += 1;
            }
        }
        let ooo_candidate = uncontended && locks_pending == 0;

        if ooo_candidate {
            trace!("Shard {}: tx {} parked for out-of-order execution", self.id, id);
        } else {
            trace!("Shard {}: tx {} queued ({} locks pending)", self.id, id, locks_pending);
            tx.veto_ooo();
            self.txq.insert(id, tx.footprint(self.id));
        }

        // A single-shard transaction decides out-of-order admission here.
        if armed && ooo_candidate {
            tx.mark_ooo();
            self.ooo_ready.push_back(id);
        }

        self.active.insert(
            id,
            ShardTx {
                tx: tx.clone(),
                locks_pending,
                queued: !ooo_candidate,
                armed,
                hops_run: 0,
            },
        );

        if !armed {
            tx.ack();
        }
    }

    fn arm(&mut self, tx: Arc<Transaction>) {
        let id = tx.id();
        let entry = match self.active.get_mut(&id) {
            Some(entry) => entry,
            None => {
                error!("Shard {}: arm for unknown tx {}", self.id, id);
                tx.ack();
                return;
            }
        };
        entry.armed = true;

        if !entry.queued {
            if tx.is_ooo() {
                self.ooo_ready.push_back(id);
            } else {
                // Another shard refused out-of-order execution: fall back to
                // the queue at the position the id dictates.
                trace!("Shard {}: tx {} demoted to the queue", self.id, id);
                entry.queued = true;
                self.counters.demotions += 1;
                self.txq.insert(id, tx.footprint(self.id));
            }
        }
    }

    /// Run every hop that is runnable right now
    pub fn poll_execution(&mut self) {
        loop {
            if let Some(id) = self.ooo_ready.pop_front() {
                self.run_hop(id);
                continue;
            }

            let head = match self.txq.head() {
                Some(head) => head,
                None => break,
            };
            let runnable = match self.active.get(&head) {
                Some(entry) => entry.armed && entry.locks_pending == 0,
                None => {
                    error!("Shard {}: queued tx {} has no state, dropping it", self.id, head);
                    self.txq.remove(head);
                    continue;
                }
            };
            if !runnable {
                break;
            }
            self.run_hop(head);
        }
    }

    fn run_hop(&mut self, id: TxId) {
        let (tx, queued) = match self.active.get_mut(&id) {
            Some(entry) if entry.armed => {
                entry.armed = false;
                entry.hops_run += 1;
                (entry.tx.clone(), entry.queued)
            }
            _ => return,
        };

        let conclude = match tx.current_hop() {
            Some((run, conclude)) => {
                let mut ctx = CommandContext::new(self.id, &mut self.store);
                run(&mut ctx);
                conclude
            }
            None => {
                error!("Shard {}: tx {} armed without a hop", self.id, id);
                false
            }
        };

        if queued {
            self.counters.queued_hops += 1;
        } else {
            self.counters.ooo_hops += 1;
        }

        if conclude {
            self.release(&tx);
        }
        tx.ack();
    }

    /// Drop every trace of `tx` from this shard
    fn release(&mut self, tx: &Transaction) {
        let id = tx.id();
        if let Some(entry) = self.active.remove(&id) {
            trace!("Shard {}: tx {} done after {} hops", self.id, id, entry.hops_run);
        }
        self.txq.remove(id);

        let part = match tx.part(self.id) {
            Some(part) => part,
            None => return,
        };
        for request in &part.locks {
            for promoted in self.locks.release(&request.target, id) {
                if let Some(waiter) = self.active.get_mut(&promoted) {
                    waiter.locks_pending = waiter.locks_pending.saturating_sub(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{KeyRouter, LockMode};
    use crate::store::Value;
    use crate::transaction::{HopFn, KeySet};
    use bytes::Bytes;

    fn tx_for(id: TxId, keys: &[&str]) -> Arc<Transaction> {
        let router = KeyRouter::new(1, false);
        let mut set = KeySet::new();
        for k in keys {
            set.add(Bytes::copy_from_slice(k.as_bytes()), LockMode::Exclusive);
        }
        let tx = Arc::new(Transaction::new(&set, &router));
        tx.assign_id(id);
        tx
    }

    fn install(tx: &Transaction, conclude: bool, f: impl Fn(&mut CommandContext<'_>) + Send + Sync + 'static) {
        let run: HopFn = Arc::new(f);
        tx.install_hop(run, conclude);
        tx.start_barrier(1);
    }

    #[test]
    fn test_uncontended_single_hop_runs_out_of_order() {
        let mut shard = EngineShard::new(0);
        let tx = tx_for(1, &["a"]);
        install(&tx, true, |ctx| {
            ctx.store.set("a", Value::integer(1));
        });

        shard.handle(ShardMessage::Schedule { tx: tx.clone(), armed: true });
        shard.poll_execution();

        assert!(tx.is_ooo());
        assert!(shard.store().exists(b"a"));
        assert!(shard.locks().is_empty());
        assert!(shard.txq().is_empty());
        assert_eq!(shard.counters().ooo_hops, 1);
    }

    #[test]
    fn test_conflicting_transactions_run_in_id_order() {
        let mut shard = EngineShard::new(0);

        // tx 1 is registered but its hop is not armed yet
        let first = tx_for(1, &["a"]);
        first.start_barrier(1);
        shard.handle(ShardMessage::Schedule { tx: first.clone(), armed: false });
        shard.poll_execution();

        let second = tx_for(2, &["a"]);
        install(&second, true, |ctx| {
            ctx.store.set("a", Value::string("second"));
        });
        shard.handle(ShardMessage::Schedule { tx: second.clone(), armed: true });
        shard.poll_execution();
        assert!(!second.is_ooo());
        assert!(!shard.store().exists(b"a"));
        assert_eq!(shard.txq().len(), 1);

        // the first is parked out of order; arming it without the ooo flag
        // demotes it ahead of the second
        install(&first, true, |ctx| {
            ctx.store.set("a", Value::string("first"));
        });
        shard.handle(ShardMessage::Arm(first.clone()));
        shard.poll_execution();

        assert_eq!(
            shard.store().get(b"a"),
            Some(&Value::string("second"))
        );
        assert!(shard.locks().is_empty());
        assert!(shard.txq().is_empty());
        assert_eq!(shard.counters().demotions, 1);
    }

    #[test]
    fn test_multi_hop_keeps_locks_between_hops() {
        let mut shard = EngineShard::new(0);
        let tx = tx_for(1, &["k"]);
        tx.start_barrier(1);
        shard.handle(ShardMessage::Schedule { tx: tx.clone(), armed: false });
        tx.mark_ooo();

        install(&tx, false, |ctx| {
            ctx.store.set("k", Value::integer(1));
        });
        shard.handle(ShardMessage::Arm(tx.clone()));
        shard.poll_execution();
        assert!(shard.locks().is_locked(b"k"));

        install(&tx, true, |ctx| {
            ctx.store.delete(b"k");
        });
        shard.handle(ShardMessage::Arm(tx.clone()));
        shard.poll_execution();
        assert!(!shard.store().exists(b"k"));
        assert!(shard.locks().is_empty());
        assert_eq!(shard.active_transactions(), 0);
    }

    #[test]
    fn test_brief_runs_against_shard() {
        let mut shard = EngineShard::new(3);
        let (reply, mut rx) = tokio::sync::oneshot::channel();
        shard.handle(ShardMessage::Brief(Box::new(move |s| {
            let _ = reply.send(s.id());
        })));
        assert_eq!(rx.try_recv().unwrap(), 3);
    }
}
