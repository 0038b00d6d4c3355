//! Turning validated commands into transaction hops
//!
//! A list of invocations (one command, a MULTI batch, or a single
//! `redis.call`) is split into steps. Consecutive commands that can finish in
//! one hop share it; a command whose two-phase keys span shards gets a read
//! hop and a write hop of its own. Shards that have nothing to do in a hop
//! still run it as a no-op so the barrier stays uniform.

use crate::cluster::{KeyRouter, ShardId};
use crate::commands::{
    check_arity, collect_snapshots, key_set, key_slots, merge_replies, partition, Command, CommandRegistry,
    ShardArgs, WriteOp,
};
use crate::error::TxError;
use crate::protocol::RespValue;
use crate::transaction::{KeySet, TxHandle};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// A data command that passed lookup, arity and syntax checks
#[derive(Clone)]
pub(crate) struct Invocation {
    pub cmd: Arc<dyn Command>,
    pub args: Vec<Bytes>,
}

impl Invocation {
    /// Resolve `name` and validate `args`; `None` if the registry has no
    /// such command
    pub fn resolve(
        registry: &CommandRegistry,
        name: &str,
        args: Vec<Bytes>,
    ) -> Option<Result<Self, RespValue>> {
        let cmd = registry.get(name)?;
        let checked = check_arity(cmd.as_ref(), &args).and_then(|_| cmd.check(&args));
        Some(checked.map(|_| Invocation { cmd, args }))
    }

    pub fn keys(&self) -> KeySet {
        key_set(self.cmd.as_ref(), &self.args)
    }
}

struct Planned {
    inv: Invocation,
    parts: Vec<ShardArgs>,
    key_count: usize,
}

enum Step {
    /// Invocations finishing in a single hop
    Batch(Vec<usize>),
    /// A cross-shard two-phase invocation
    TwoPhase(usize),
}

fn plan(invocations: Vec<Invocation>, router: &KeyRouter) -> (Vec<Planned>, Vec<Step>) {
    let planned: Vec<Planned> = invocations
        .into_iter()
        .map(|inv| {
            let parts = partition(inv.cmd.as_ref(), &inv.args, router);
            let key_count = key_slots(inv.cmd.as_ref(), &inv.args);
            Planned { inv, parts, key_count }
        })
        .collect();

    let mut steps = Vec::new();
    let mut batch = Vec::new();
    for (idx, p) in planned.iter().enumerate() {
        if p.parts.len() > 1 && p.inv.cmd.two_phase().is_some() {
            if !batch.is_empty() {
                steps.push(Step::Batch(std::mem::take(&mut batch)));
            }
            steps.push(Step::TwoPhase(idx));
        } else {
            batch.push(idx);
        }
    }
    if !batch.is_empty() {
        steps.push(Step::Batch(batch));
    }
    (planned, steps)
}

/// Run `invocations` inside `handle`'s transaction and return one reply per
/// invocation
///
/// With `conclude` set the last hop releases the transaction.
pub(crate) async fn run_invocations(
    handle: &mut TxHandle,
    router: &KeyRouter,
    invocations: Vec<Invocation>,
    conclude: bool,
) -> Result<Vec<RespValue>, TxError> {
    let (planned, steps) = plan(invocations, router);
    let planned = Arc::new(planned);
    let mut replies = vec![RespValue::Null; planned.len()];

    if steps.is_empty() && conclude {
        handle.conclude().await?;
    }

    let step_count = steps.len();
    for (step_idx, step) in steps.into_iter().enumerate() {
        let last = conclude && step_idx + 1 == step_count;
        match step {
            Step::Batch(indices) => {
                let indices = Arc::new(indices);
                let plan = planned.clone();
                let hop_indices = indices.clone();
                let results = handle
                    .execute(last, move |ctx| {
                        let shard = ctx.shard_id;
                        let mut out = Vec::new();
                        for &idx in hop_indices.iter() {
                            let p = &plan[idx];
                            for part in p.parts.iter().filter(|part| part.shard == shard) {
                                let reply = p.inv.cmd.execute(ctx, &part.args);
                                out.push((idx, part.slots.clone(), reply));
                            }
                        }
                        out
                    })
                    .await?;

                let mut per_invocation: HashMap<usize, Vec<(Vec<usize>, RespValue)>> =
                    HashMap::new();
                for (_, rows) in results {
                    for (idx, slots, reply) in rows {
                        per_invocation.entry(idx).or_default().push((slots, reply));
                    }
                }
                for &idx in indices.iter() {
                    let p = &planned[idx];
                    let rows = per_invocation.remove(&idx).unwrap_or_default();
                    replies[idx] = merge_replies(p.inv.cmd.merge(), p.key_count, rows);
                }
            }
            Step::TwoPhase(idx) => {
                let plan = planned.clone();
                let snapshots = handle
                    .execute(false, move |ctx| {
                        let p = &plan[idx];
                        match p.inv.cmd.two_phase() {
                            Some(tp) => tp.read(ctx, &p.inv.args),
                            None => Vec::new(),
                        }
                    })
                    .await?;

                let p = &planned[idx];
                let found = collect_snapshots(snapshots.into_iter().map(|(_, s)| s).collect());
                let (reply, writes) = match p.inv.cmd.two_phase() {
                    Some(tp) => tp.decide(&p.inv.args, &found),
                    None => (RespValue::error("ERR internal error"), Vec::new()),
                };
                let routed: Arc<Vec<(ShardId, WriteOp)>> = Arc::new(
                    writes
                        .into_iter()
                        .map(|op| (router.shard_for(op.key()), op))
                        .collect(),
                );
                handle
                    .execute(last, move |ctx| {
                        for (shard, op) in routed.iter() {
                            if *shard == ctx.shard_id {
                                op.apply(ctx);
                            }
                        }
                    })
                    .await?;
                replies[idx] = reply;
            }
        }
    }

    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(registry: &CommandRegistry, parts: &[&str]) -> Invocation {
        let args = parts[1..]
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect();
        Invocation::resolve(registry, parts[0], args).unwrap().unwrap()
    }

    /// Two keys that route to different shards
    fn split_keys(router: &KeyRouter) -> (String, String) {
        let first = "x".to_string();
        let shard = router.shard_for(first.as_bytes());
        let second = (0..)
            .map(|i| format!("y{}", i))
            .find(|k| router.shard_for(k.as_bytes()) != shard)
            .unwrap();
        (first, second)
    }

    #[test]
    fn test_plan_groups_single_hop_commands() {
        let registry = CommandRegistry::new();
        let router = KeyRouter::new(4, false);
        let (a, b) = split_keys(&router);

        let invocations = vec![
            inv(&registry, &["SET", &a, "1"]),
            inv(&registry, &["MGET", &a, &b]),
            inv(&registry, &["RENAME", &a, &b]),
            inv(&registry, &["GET", &b]),
        ];
        let (planned, steps) = plan(invocations, &router);

        assert_eq!(planned[1].parts.len(), 2);
        assert_eq!(steps.len(), 3);
        assert!(matches!(&steps[0], Step::Batch(v) if v == &vec![0, 1]));
        assert!(matches!(&steps[1], Step::TwoPhase(2)));
        assert!(matches!(&steps[2], Step::Batch(v) if v == &vec![3]));
    }

    #[test]
    fn test_rename_on_one_shard_is_single_hop() {
        let registry = CommandRegistry::new();
        let router = KeyRouter::new(1, false);
        let (planned, steps) = plan(vec![inv(&registry, &["RENAME", "a", "b"])], &router);
        assert_eq!(planned[0].parts.len(), 1);
        assert!(matches!(&steps[0], Step::Batch(_)));
    }

    #[test]
    fn test_repeated_keys_keep_their_reply_slots() {
        let registry = CommandRegistry::new();
        for num_shards in [1, 4] {
            let router = KeyRouter::new(num_shards, false);
            let (planned, _) = plan(vec![inv(&registry, &["MGET", "a", "b", "a"])], &router);
            assert_eq!(planned[0].key_count, 3);
            let mut slots: Vec<usize> = planned[0]
                .parts
                .iter()
                .flat_map(|part| part.slots.clone())
                .collect();
            slots.sort();
            assert_eq!(slots, vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_resolve_rejects_bad_arity() {
        let registry = CommandRegistry::new();
        let result = Invocation::resolve(&registry, "get", Vec::new()).unwrap();
        assert!(result.is_err());
        assert!(Invocation::resolve(&registry, "nosuch", Vec::new()).is_none());
    }
}
