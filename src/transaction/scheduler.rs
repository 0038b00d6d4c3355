//! Transaction coordinator
//!
//! `TxScheduler` hands out transaction ids and registers transactions on the
//! shards; `TxHandle` drives one transaction through its hops from the
//! connection task.

use super::{HopFn, KeySet, Transaction, TxState};
use crate::cluster::{ShardId, ShardMessage, ShardSet, TxId};
use crate::commands::CommandContext;
use crate::error::TxError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{trace, warn};

/// Registers transactions on the shard set in a single global order
pub struct TxScheduler {
    shards: Arc<ShardSet>,
    /// Last id handed out. Held while schedule messages are sent so every
    /// shard sees registrations in id order.
    next_id: Mutex<TxId>,
}

impl TxScheduler {
    pub fn new(shards: Arc<ShardSet>) -> Self {
        TxScheduler {
            shards,
            next_id: Mutex::new(0),
        }
    }

    pub fn shard_set(&self) -> &Arc<ShardSet> {
        &self.shards
    }

    /// Start a transaction over `keys`; nothing is registered until the
    /// first `schedule` or `execute`
    pub fn begin(self: &Arc<Self>, keys: KeySet) -> TxHandle {
        let tx = Arc::new(Transaction::new(&keys, self.shards.router()));
        TxHandle {
            scheduler: self.clone(),
            tx,
            keys,
            scheduled: false,
            concluded: false,
        }
    }

    /// Assign the next id and send `Schedule` to every participating shard
    fn register(&self, tx: &Arc<Transaction>, armed: bool) -> Result<(), TxError> {
        let mut next_id = self.next_id.lock();
        *next_id += 1;
        tx.assign_id(*next_id);

        tx.start_barrier(tx.shard_count());
        for part in tx.parts() {
            self.shards.send(
                part.shard,
                ShardMessage::Schedule {
                    tx: tx.clone(),
                    armed,
                },
            )?;
        }
        Ok(())
    }
}

/// Coordinator-side handle of one transaction
pub struct TxHandle {
    scheduler: Arc<TxScheduler>,
    tx: Arc<Transaction>,
    keys: KeySet,
    scheduled: bool,
    concluded: bool,
}

impl TxHandle {
    pub fn id(&self) -> TxId {
        self.tx.id()
    }

    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    pub fn shard_count(&self) -> usize {
        self.tx.shard_count()
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.tx.parts().iter().map(|p| p.shard)
    }

    pub fn is_ooo(&self) -> bool {
        self.tx.is_ooo()
    }

    pub fn state(&self) -> TxState {
        self.tx.state()
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }

    /// Reject the transaction before it reaches any shard
    pub fn abort(mut self) {
        if !self.scheduled {
            self.tx.set_state(TxState::Aborted);
        }
        self.concluded = true;
    }

    /// Register on every participating shard and wait until each one has
    /// queued the transaction (or parked it for out-of-order execution)
    pub async fn schedule(&mut self) -> Result<(), TxError> {
        if self.scheduled {
            return Ok(());
        }
        if self.tx.shard_count() == 0 {
            self.scheduled = true;
            self.tx.set_state(TxState::Armed);
            return Ok(());
        }

        self.scheduler.register(&self.tx, false)?;
        self.scheduled = true;
        self.tx.wait_barrier().await;

        if !self.tx.ooo_vetoed() {
            self.tx.mark_ooo();
        }
        self.tx.set_state(TxState::Armed);
        trace!(
            "tx {} scheduled on {} shards, ooo={}",
            self.tx.id(),
            self.tx.shard_count(),
            self.tx.is_ooo()
        );
        Ok(())
    }

    /// Run one hop on every participating shard and collect the per-shard
    /// results, ordered by shard
    ///
    /// With `conclude` set this is the final hop: each shard releases the
    /// transaction's locks and queue entry right after running `f`.
    pub async fn execute<F, R>(&mut self, conclude: bool, f: F) -> Result<Vec<(ShardId, R)>, TxError>
    where
        F: Fn(&mut CommandContext<'_>) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        if self.concluded {
            return Err(TxError::Concluded(self.tx.id()));
        }

        let replies: Arc<Mutex<Vec<(ShardId, R)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(self.tx.shard_count())));
        let sink = replies.clone();
        let run: HopFn = Arc::new(move |ctx: &mut CommandContext<'_>| {
            let reply = f(ctx);
            sink.lock().push((ctx.shard_id, reply));
        });

        if self.tx.shard_count() == 0 {
            if conclude {
                self.finish();
            }
            return Ok(Vec::new());
        }

        self.tx.install_hop(run, conclude);

        if !self.scheduled && conclude && self.tx.shard_count() == 1 {
            // Single shard, single hop: the shard decides out-of-order
            // admission on its own and runs the hop as soon as it can.
            self.tx.set_state(TxState::Executing);
            self.scheduler.register(&self.tx, true)?;
            self.scheduled = true;
        } else {
            self.schedule().await?;
            self.tx.set_state(TxState::Executing);
            self.arm()?;
        }
        self.tx.wait_barrier().await;

        if conclude {
            self.finish();
        }

        let mut out = std::mem::take(&mut *replies.lock());
        out.sort_by_key(|(shard, _)| *shard);
        Ok(out)
    }

    /// Run a final no-op hop if the transaction still holds shard state
    pub async fn conclude(&mut self) -> Result<(), TxError> {
        if self.concluded {
            return Ok(());
        }
        if !self.scheduled {
            self.finish();
            return Ok(());
        }
        self.execute(true, |_| ()).await.map(|_| ())
    }

    fn arm(&self) -> Result<(), TxError> {
        self.tx.start_barrier(self.tx.shard_count());
        for part in self.tx.parts() {
            self.scheduler
                .shards
                .send(part.shard, ShardMessage::Arm(self.tx.clone()))?;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.concluded = true;
        self.tx.set_state(TxState::Done);
    }
}

impl Drop for TxHandle {
    fn drop(&mut self) {
        if !self.scheduled || self.concluded || self.tx.shard_count() == 0 {
            return;
        }
        // Still registered on the shards: release everything with a final
        // empty hop nobody waits for.
        let noop: HopFn = Arc::new(|_: &mut CommandContext<'_>| {});
        self.tx.install_hop(noop, true);
        if let Err(e) = self.arm() {
            warn!("Failed to release tx {}: {}", self.tx.id(), e);
        }
        self.tx.set_state(TxState::Done);
    }
}
