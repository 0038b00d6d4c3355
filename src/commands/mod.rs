//! Command execution module
//!
//! Every data command implements the `Command` trait. A command declares its
//! arity, its keys (or that it touches the whole keyspace) and how replies from
//! several shards are combined; `execute` then runs shard-locally inside a
//! transaction hop on the arguments routed to that shard.

mod context;
mod registry;

mod counter;
mod key;
mod keyspace;
mod string;

pub use context::CommandContext;
pub use registry::CommandRegistry;

use crate::cluster::{KeyRouter, LockMode, ShardId};
use crate::protocol::RespValue;
use crate::store::Entry;
use crate::transaction::KeySet;
use bytes::Bytes;
use std::collections::HashMap;

/// Where the keys sit in a command's arguments (command name excluded)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    pub first: usize,
    /// Last key position; negative values count from the end
    pub last: isize,
    pub step: usize,
}

impl KeySpec {
    /// Exactly one key, the first argument
    pub const SINGLE: KeySpec = KeySpec { first: 0, last: 0, step: 1 };
    /// Every argument is a key
    pub const ALL: KeySpec = KeySpec { first: 0, last: -1, step: 1 };
    /// Alternating key/value pairs
    pub const PAIRS: KeySpec = KeySpec { first: 0, last: -1, step: 2 };

    /// Argument indices holding keys
    pub fn positions(&self, argc: usize) -> Vec<usize> {
        let last = if self.last < 0 {
            argc as isize + self.last
        } else {
            self.last
        };
        if last < self.first as isize {
            return Vec::new();
        }
        let last = (last as usize).min(argc.saturating_sub(1));
        (self.first..=last).step_by(self.step.max(1)).collect()
    }
}

/// What a command touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Keyed(KeySpec),
    /// Runs on every shard under the exclusive shard lock
    Global,
}

/// How per-shard replies become the client reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// Single-shard commands: the only reply
    First,
    /// Integer replies added up
    Sum,
    /// Array replies put back in key order
    ByPosition,
    /// `+OK` once every shard succeeded
    AllOk,
    /// Array replies appended
    Concat,
}

/// Command execution trait
pub trait Command: Send + Sync {
    /// Get the command name (for debugging/logging)
    fn name(&self) -> &'static str;

    /// Get the minimum number of arguments required
    fn min_args(&self) -> usize {
        0
    }

    /// Get the maximum number of arguments (None = unlimited)
    fn max_args(&self) -> Option<usize> {
        None
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Keyed(KeySpec::SINGLE)
    }

    /// Whether the command modifies its keys (exclusive locks)
    fn is_write(&self) -> bool {
        false
    }

    fn merge(&self) -> Merge {
        Merge::First
    }

    /// Reject malformed arguments before anything is scheduled
    fn check(&self, _args: &[Bytes]) -> Result<(), RespValue> {
        Ok(())
    }

    /// Commands that need a read phase on all their shards before writing
    fn two_phase(&self) -> Option<&dyn TwoPhase> {
        None
    }

    /// Execute the command on one shard
    ///
    /// `args` holds only the part of the arguments routed to this shard.
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue;
}

/// Keys read in the first hop of a two-phase command, with their entries
pub type Snapshot = Vec<(Bytes, Option<Entry>)>;

/// A write decided by the coordinator between two hops
#[derive(Debug, Clone)]
pub enum WriteOp {
    Delete(Bytes),
    Put(Entry),
}

impl WriteOp {
    pub fn key(&self) -> &Bytes {
        match self {
            WriteOp::Delete(key) => key,
            WriteOp::Put(entry) => &entry.key,
        }
    }

    pub fn apply(&self, ctx: &mut CommandContext<'_>) {
        match self {
            WriteOp::Delete(key) => {
                ctx.store.delete(key);
            }
            WriteOp::Put(entry) => {
                ctx.store
                    .set_with_flags(entry.key.clone(), entry.value.clone(), entry.flags);
            }
        }
    }
}

/// Read / decide / write split of a command spanning shards
pub trait TwoPhase: Send + Sync {
    /// First hop, on every participating shard
    fn read(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> Snapshot {
        args.iter()
            .map(|key| (key.clone(), ctx.store.get_entry(key).cloned()))
            .collect()
    }

    /// On the coordinator: the client reply and the writes of the second hop
    fn decide(&self, args: &[Bytes], found: &HashMap<Bytes, Entry>) -> (RespValue, Vec<WriteOp>);
}

/// Run a two-phase command entirely on one shard
pub(crate) fn run_two_phase_locally(
    tp: &dyn TwoPhase,
    ctx: &mut CommandContext<'_>,
    args: &[Bytes],
) -> RespValue {
    let found = collect_snapshots(vec![tp.read(ctx, args)]);
    let (reply, writes) = tp.decide(args, &found);
    for op in &writes {
        op.apply(ctx);
    }
    reply
}

/// Merge first-hop snapshots; a key only exists on its own shard
pub(crate) fn collect_snapshots(snapshots: Vec<Snapshot>) -> HashMap<Bytes, Entry> {
    snapshots
        .into_iter()
        .flatten()
        .filter_map(|(key, entry)| entry.map(|e| (key, e)))
        .collect()
}

/// The arguments one shard receives for one command
#[derive(Debug, Clone)]
pub struct ShardArgs {
    pub shard: ShardId,
    pub args: Vec<Bytes>,
    /// Key ordinals (0-based among the command's keys) carried by `args`
    pub slots: Vec<usize>,
}

/// `ERR wrong number of arguments` unless `args` fits the declared arity
pub fn check_arity(cmd: &dyn Command, args: &[Bytes]) -> Result<(), RespValue> {
    let too_many = cmd.max_args().map_or(false, |max| args.len() > max);
    if args.len() < cmd.min_args() || too_many {
        return Err(wrong_args(cmd.name()));
    }
    Ok(())
}

pub fn wrong_args(name: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

/// The keys a command declares, with the lock mode it needs on them
pub fn key_set(cmd: &dyn Command, args: &[Bytes]) -> KeySet {
    let spec = match cmd.kind() {
        CommandKind::Global => return KeySet::global(),
        CommandKind::Keyed(spec) => spec,
    };
    let mode = if cmd.is_write() {
        LockMode::Exclusive
    } else {
        LockMode::Shared
    };
    let mut keys = KeySet::new();
    for pos in spec.positions(args.len()) {
        keys.add(args[pos].clone(), mode);
    }
    keys
}

/// Number of key arguments, repeats included; one reply slot each
pub fn key_slots(cmd: &dyn Command, args: &[Bytes]) -> usize {
    match cmd.kind() {
        CommandKind::Global => 0,
        CommandKind::Keyed(spec) => spec.positions(args.len()).len(),
    }
}

/// Split a command's arguments by shard
///
/// Single-shard commands get their arguments untouched; multi-key commands
/// get one chunk per key (the key and the values following it).
pub fn partition(cmd: &dyn Command, args: &[Bytes], router: &KeyRouter) -> Vec<ShardArgs> {
    let spec = match cmd.kind() {
        CommandKind::Global => {
            return (0..router.num_shards())
                .map(|shard| ShardArgs {
                    shard,
                    args: args.to_vec(),
                    slots: Vec::new(),
                })
                .collect()
        }
        CommandKind::Keyed(spec) => spec,
    };

    let positions = spec.positions(args.len());
    let shards = router.shards_for(positions.iter().map(|&pos| &args[pos]));
    if shards.len() <= 1 {
        return shards
            .into_iter()
            .map(|shard| ShardArgs {
                shard,
                args: args.to_vec(),
                slots: (0..positions.len()).collect(),
            })
            .collect();
    }

    let mut parts: Vec<ShardArgs> = shards
        .into_iter()
        .map(|shard| ShardArgs {
            shard,
            args: Vec::new(),
            slots: Vec::new(),
        })
        .collect();
    for (slot, &pos) in positions.iter().enumerate() {
        let shard = router.shard_for(&args[pos]);
        if let Ok(idx) = parts.binary_search_by_key(&shard, |p| p.shard) {
            let end = (pos + spec.step).min(args.len());
            parts[idx].args.extend_from_slice(&args[pos..end]);
            parts[idx].slots.push(slot);
        }
    }
    parts
}

/// Combine the replies of every shard a command ran on
///
/// `replies` pairs each reply with the key ordinals its shard handled. The
/// first error reply wins.
pub fn merge_replies(merge: Merge, key_count: usize, replies: Vec<(Vec<usize>, RespValue)>) -> RespValue {
    if let Some((_, err)) = replies.iter().find(|(_, r)| r.is_error()) {
        return err.clone();
    }

    match merge {
        Merge::First => replies
            .into_iter()
            .next()
            .map(|(_, r)| r)
            .unwrap_or(RespValue::Null),
        Merge::Sum => RespValue::integer(
            replies
                .iter()
                .map(|(_, r)| match r {
                    RespValue::Integer(n) => *n,
                    _ => 0,
                })
                .sum(),
        ),
        Merge::ByPosition => {
            let mut out = vec![RespValue::Null; key_count];
            for (slots, reply) in replies {
                if let RespValue::Array(items) = reply {
                    for (slot, item) in slots.into_iter().zip(items) {
                        if slot < out.len() {
                            out[slot] = item;
                        }
                    }
                }
            }
            RespValue::array(out)
        }
        Merge::AllOk => RespValue::ok(),
        Merge::Concat => RespValue::array(
            replies
                .into_iter()
                .flat_map(|(_, r)| match r {
                    RespValue::Array(items) => items,
                    _ => Vec::new(),
                })
                .collect(),
        ),
    }
}

/// Parse a decimal integer argument
pub(crate) fn parse_i64(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse::<i64>().ok()
}

pub(crate) fn not_an_integer() -> RespValue {
    RespValue::error("ERR value is not an integer or out of range")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_key_positions() {
        assert_eq!(KeySpec::SINGLE.positions(3), vec![0]);
        assert_eq!(KeySpec::ALL.positions(3), vec![0, 1, 2]);
        assert_eq!(KeySpec::PAIRS.positions(4), vec![0, 2]);
        assert_eq!(KeySpec { first: 0, last: 1, step: 1 }.positions(2), vec![0, 1]);
        assert!(KeySpec::ALL.positions(0).is_empty());
    }

    #[test]
    fn test_partition_pairs_by_shard() {
        let registry = CommandRegistry::new();
        let mset = registry.get("MSET").unwrap();
        let router = KeyRouter::new(4, false);

        let argv = args(&["a", "1", "b", "2", "c", "3", "d", "4", "e", "5"]);
        let parts = partition(mset.as_ref(), &argv, &router);

        let mut seen = Vec::new();
        for part in &parts {
            assert_eq!(part.args.len(), part.slots.len() * 2);
            for (chunk, slot) in part.args.chunks(2).zip(&part.slots) {
                assert_eq!(router.shard_for(&chunk[0]), part.shard);
                assert_eq!(chunk[0], argv[slot * 2]);
                seen.push(*slot);
            }
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_by_position() {
        let replies = vec![
            (vec![1], RespValue::array(vec![RespValue::bulk_string("b")])),
            (vec![0, 2], RespValue::array(vec![RespValue::bulk_string("a"), RespValue::Null])),
        ];
        assert_eq!(
            merge_replies(Merge::ByPosition, 3, replies),
            RespValue::array(vec![
                RespValue::bulk_string("a"),
                RespValue::bulk_string("b"),
                RespValue::Null,
            ])
        );
    }

    #[test]
    fn test_merge_error_wins() {
        let replies = vec![
            (vec![], RespValue::integer(1)),
            (vec![], RespValue::error("ERR boom")),
        ];
        assert_eq!(merge_replies(Merge::Sum, 0, replies), RespValue::error("ERR boom"));
    }

    #[test]
    fn test_arity() {
        let registry = CommandRegistry::new();
        let get = registry.get("get").unwrap();
        assert!(check_arity(get.as_ref(), &args(&["k"])).is_ok());
        assert_eq!(
            check_arity(get.as_ref(), &args(&["k", "x"])),
            Err(RespValue::error("ERR wrong number of arguments for 'get' command"))
        );
    }

    #[test]
    fn test_key_set_modes() {
        let registry = CommandRegistry::new();
        let flush = registry.get("FLUSHDB").unwrap();
        assert!(key_set(flush.as_ref(), &[]).is_global());

        let mget = registry.get("MGET").unwrap();
        let keys = key_set(mget.as_ref(), &args(&["a", "b", "a"]));
        assert_eq!(keys.len(), 2);
        assert_eq!(key_slots(mget.as_ref(), &args(&["a", "b", "a"])), 3);
        assert_eq!(key_slots(flush.as_ref(), &[]), 0);
    }
}
