//! Key commands (DEL, EXISTS, RENAME, RENAMENX)

use super::{
    run_two_phase_locally, Command, CommandContext, CommandKind, KeySpec, Merge, TwoPhase,
    WriteOp,
};
use crate::protocol::RespValue;
use crate::store::Entry;
use bytes::Bytes;
use std::collections::HashMap;

/// DEL command - Delete one or more keys
///
/// Syntax: DEL key [key ...]
pub struct DelCommand;

impl Command for DelCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        let deleted = args.iter().filter(|key| ctx.store.delete(key)).count();
        RespValue::integer(deleted as i64)
    }

    fn name(&self) -> &'static str {
        "DEL"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Keyed(KeySpec::ALL)
    }

    fn is_write(&self) -> bool {
        true
    }

    fn merge(&self) -> Merge {
        Merge::Sum
    }
}

/// EXISTS command - Count how many of the given keys exist
///
/// Syntax: EXISTS key [key ...]
pub struct ExistsCommand;

impl Command for ExistsCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        let count = args.iter().filter(|key| ctx.store.exists(key)).count();
        RespValue::integer(count as i64)
    }

    fn name(&self) -> &'static str {
        "EXISTS"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Keyed(KeySpec::ALL)
    }

    fn merge(&self) -> Merge {
        Merge::Sum
    }
}

const RENAME_KEYS: KeySpec = KeySpec { first: 0, last: 1, step: 1 };

/// Shared decision logic of RENAME and RENAMENX
///
/// When source and destination live on different shards, the first hop reads
/// both, the coordinator decides here, and the second hop applies the writes.
struct Rename {
    only_if_new: bool,
}

static RENAME: Rename = Rename { only_if_new: false };
static RENAME_NX: Rename = Rename { only_if_new: true };

impl TwoPhase for Rename {
    fn decide(&self, args: &[Bytes], found: &HashMap<Bytes, Entry>) -> (RespValue, Vec<WriteOp>) {
        let (src, dst) = (&args[0], &args[1]);

        let source = match found.get(src) {
            Some(entry) => entry,
            None => return (RespValue::error("ERR no such key"), Vec::new()),
        };

        if self.only_if_new && found.contains_key(dst) {
            return (RespValue::integer(0), Vec::new());
        }
        let success = if self.only_if_new {
            RespValue::integer(1)
        } else {
            RespValue::ok()
        };
        if src == dst {
            return (success, Vec::new());
        }

        let mut moved = source.clone();
        moved.key = dst.clone();
        (success, vec![WriteOp::Delete(src.clone()), WriteOp::Put(moved)])
    }
}

/// RENAME command
///
/// Syntax: RENAME key newkey
pub struct RenameCommand;

impl Command for RenameCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        run_two_phase_locally(&RENAME, ctx, args)
    }

    fn two_phase(&self) -> Option<&dyn TwoPhase> {
        Some(&RENAME)
    }

    fn name(&self) -> &'static str {
        "RENAME"
    }

    fn min_args(&self) -> usize {
        2
    }

    fn max_args(&self) -> Option<usize> {
        Some(2)
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Keyed(RENAME_KEYS)
    }

    fn is_write(&self) -> bool {
        true
    }
}

/// RENAMENX command - Rename only if the new key does not exist
///
/// Syntax: RENAMENX key newkey
pub struct RenameNxCommand;

impl Command for RenameNxCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        run_two_phase_locally(&RENAME_NX, ctx, args)
    }

    fn two_phase(&self) -> Option<&dyn TwoPhase> {
        Some(&RENAME_NX)
    }

    fn name(&self) -> &'static str {
        "RENAMENX"
    }

    fn min_args(&self) -> usize {
        2
    }

    fn max_args(&self) -> Option<usize> {
        Some(2)
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Keyed(RENAME_KEYS)
    }

    fn is_write(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Value};

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_del() {
        let mut store = MemoryStore::new();
        store.set("key1", Value::string("value1"));
        store.set("key2", Value::string("value2"));
        let mut ctx = CommandContext::new(0, &mut store);

        let result = DelCommand.execute(&mut ctx, &args(&["key1", "key2", "key3"]));
        assert_eq!(result, RespValue::integer(2));
        assert!(!ctx.store.exists(b"key1"));
    }

    #[test]
    fn test_exists() {
        let mut store = MemoryStore::new();
        store.set("key1", Value::string("value1"));
        let mut ctx = CommandContext::new(0, &mut store);

        let result = ExistsCommand.execute(&mut ctx, &args(&["key1", "key1", "nope"]));
        assert_eq!(result, RespValue::integer(2));
    }

    #[test]
    fn test_rename_local() {
        let mut store = MemoryStore::new();
        store.set_with_flags("x", Value::string("v"), 9);
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(RenameCommand.execute(&mut ctx, &args(&["x", "y"])), RespValue::ok());
        assert!(!ctx.store.exists(b"x"));
        assert_eq!(ctx.store.get_entry(b"y").unwrap().flags, 9);

        assert_eq!(
            RenameCommand.execute(&mut ctx, &args(&["x", "y"])),
            RespValue::error("ERR no such key")
        );
        assert_eq!(RenameCommand.execute(&mut ctx, &args(&["y", "y"])), RespValue::ok());
        assert!(ctx.store.exists(b"y"));
    }

    #[test]
    fn test_renamenx() {
        let mut store = MemoryStore::new();
        store.set("a", Value::integer(1));
        store.set("b", Value::integer(2));
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(RenameNxCommand.execute(&mut ctx, &args(&["a", "b"])), RespValue::integer(0));
        assert_eq!(RenameNxCommand.execute(&mut ctx, &args(&["a", "c"])), RespValue::integer(1));
        assert_eq!(ctx.store.get(b"c"), Some(&Value::integer(1)));
    }

    #[test]
    fn test_rename_decision_from_snapshots() {
        let rename = Rename { only_if_new: false };
        let mut found = HashMap::new();
        found.insert(Bytes::from("src"), Entry::new("src", Value::string("v")));

        let (reply, writes) = rename.decide(&args(&["src", "dst"]), &found);
        assert_eq!(reply, RespValue::ok());
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].key(), &Bytes::from("src"));
        assert_eq!(writes[1].key(), &Bytes::from("dst"));
    }
}
