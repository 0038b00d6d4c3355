//! String commands (GET, SET, APPEND, STRLEN, MGET, MSET)

use super::{Command, CommandContext, KeySpec, CommandKind, Merge};
use crate::protocol::RespValue;
use crate::store::Value;
use bytes::{Bytes, BytesMut};

/// GET command - Get the value of a key
///
/// Syntax: GET key
pub struct GetCommand;

impl Command for GetCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        match ctx.store.get(&args[0]) {
            Some(value) => RespValue::bulk_string(value.to_bytes()),
            None => RespValue::null(),
        }
    }

    fn name(&self) -> &'static str {
        "GET"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn max_args(&self) -> Option<usize> {
        Some(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetCondition {
    Always,
    IfMissing,
    IfExists,
}

fn parse_set_condition(options: &[Bytes]) -> Result<SetCondition, RespValue> {
    let mut condition = SetCondition::Always;
    for option in options {
        let next = if option.eq_ignore_ascii_case(b"NX") {
            SetCondition::IfMissing
        } else if option.eq_ignore_ascii_case(b"XX") {
            SetCondition::IfExists
        } else {
            return Err(RespValue::error("ERR syntax error"));
        };
        if condition != SetCondition::Always && condition != next {
            return Err(RespValue::error("ERR syntax error"));
        }
        condition = next;
    }
    Ok(condition)
}

/// SET command - Set a key to a value
///
/// Syntax: SET key value [NX|XX]
pub struct SetCommand;

impl Command for SetCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        let condition = match parse_set_condition(&args[2..]) {
            Ok(c) => c,
            Err(e) => return e,
        };

        let exists = ctx.store.exists(&args[0]);
        let allowed = match condition {
            SetCondition::Always => true,
            SetCondition::IfMissing => !exists,
            SetCondition::IfExists => exists,
        };
        if !allowed {
            return RespValue::null();
        }

        ctx.store.set(args[0].clone(), Value::from_bytes(args[1].clone()));
        RespValue::ok()
    }

    fn check(&self, args: &[Bytes]) -> Result<(), RespValue> {
        parse_set_condition(&args[2..]).map(|_| ())
    }

    fn name(&self) -> &'static str {
        "SET"
    }

    fn min_args(&self) -> usize {
        2
    }

    fn max_args(&self) -> Option<usize> {
        Some(3)
    }

    fn is_write(&self) -> bool {
        true
    }
}

/// APPEND command - Append a value to a key
///
/// Syntax: APPEND key value
pub struct AppendCommand;

impl Command for AppendCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        let (bytes, flags) = match ctx.store.get_entry(&args[0]) {
            Some(entry) => {
                let current = entry.value.to_bytes();
                let mut buf = BytesMut::with_capacity(current.len() + args[1].len());
                buf.extend_from_slice(&current);
                buf.extend_from_slice(&args[1]);
                (buf.freeze(), entry.flags)
            }
            None => (args[1].clone(), 0),
        };

        let len = bytes.len();
        ctx.store
            .set_with_flags(args[0].clone(), Value::from_bytes(bytes), flags);
        RespValue::integer(len as i64)
    }

    fn name(&self) -> &'static str {
        "APPEND"
    }

    fn min_args(&self) -> usize {
        2
    }

    fn max_args(&self) -> Option<usize> {
        Some(2)
    }

    fn is_write(&self) -> bool {
        true
    }
}

/// STRLEN command
///
/// Syntax: STRLEN key
pub struct StrLenCommand;

impl Command for StrLenCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        let len = ctx.store.get(&args[0]).map_or(0, |v| v.len());
        RespValue::integer(len as i64)
    }

    fn name(&self) -> &'static str {
        "STRLEN"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn max_args(&self) -> Option<usize> {
        Some(1)
    }
}

/// MGET command - Get the values of several keys
///
/// Syntax: MGET key [key ...]
pub struct MGetCommand;

impl Command for MGetCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        RespValue::array(
            args.iter()
                .map(|key| match ctx.store.get(key) {
                    Some(value) => RespValue::bulk_string(value.to_bytes()),
                    None => RespValue::null(),
                })
                .collect(),
        )
    }

    fn name(&self) -> &'static str {
        "MGET"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Keyed(KeySpec::ALL)
    }

    fn merge(&self) -> Merge {
        Merge::ByPosition
    }
}

/// MSET command - Set several keys at once
///
/// Syntax: MSET key value [key value ...]
pub struct MSetCommand;

impl Command for MSetCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        for pair in args.chunks_exact(2) {
            ctx.store.set(pair[0].clone(), Value::from_bytes(pair[1].clone()));
        }
        RespValue::ok()
    }

    fn check(&self, args: &[Bytes]) -> Result<(), RespValue> {
        if args.len() % 2 != 0 {
            return Err(super::wrong_args(self.name()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MSET"
    }

    fn min_args(&self) -> usize {
        2
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Keyed(KeySpec::PAIRS)
    }

    fn is_write(&self) -> bool {
        true
    }

    fn merge(&self) -> Merge {
        Merge::AllOk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_set_get() {
        let mut store = MemoryStore::new();
        let mut ctx = CommandContext::new(0, &mut store);

        let result = SetCommand.execute(&mut ctx, &args(&["mykey", "myvalue"]));
        assert_eq!(result, RespValue::ok());

        let result = GetCommand.execute(&mut ctx, &args(&["mykey"]));
        assert_eq!(result, RespValue::bulk_string("myvalue"));
    }

    #[test]
    fn test_get_nonexistent() {
        let mut store = MemoryStore::new();
        let mut ctx = CommandContext::new(0, &mut store);
        assert_eq!(GetCommand.execute(&mut ctx, &args(&["nope"])), RespValue::Null);
    }

    #[test]
    fn test_set_nx_xx() {
        let mut store = MemoryStore::new();
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(SetCommand.execute(&mut ctx, &args(&["k", "1", "XX"])), RespValue::Null);
        assert_eq!(SetCommand.execute(&mut ctx, &args(&["k", "1", "nx"])), RespValue::ok());
        assert_eq!(SetCommand.execute(&mut ctx, &args(&["k", "2", "NX"])), RespValue::Null);
        assert_eq!(SetCommand.execute(&mut ctx, &args(&["k", "3", "XX"])), RespValue::ok());
        assert_eq!(GetCommand.execute(&mut ctx, &args(&["k"])), RespValue::bulk_string("3"));

        assert!(SetCommand.check(&args(&["k", "v", "EX"])).is_err());
    }

    #[test]
    fn test_append_strlen() {
        let mut store = MemoryStore::new();
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(AppendCommand.execute(&mut ctx, &args(&["k", "12"])), RespValue::integer(2));
        assert_eq!(AppendCommand.execute(&mut ctx, &args(&["k", "ab"])), RespValue::integer(4));
        assert_eq!(StrLenCommand.execute(&mut ctx, &args(&["k"])), RespValue::integer(4));
        assert_eq!(GetCommand.execute(&mut ctx, &args(&["k"])), RespValue::bulk_string("12ab"));
        assert_eq!(StrLenCommand.execute(&mut ctx, &args(&["missing"])), RespValue::integer(0));
    }

    #[test]
    fn test_mset_mget_local() {
        let mut store = MemoryStore::new();
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(MSetCommand.execute(&mut ctx, &args(&["a", "1", "b", "2"])), RespValue::ok());
        assert_eq!(
            MGetCommand.execute(&mut ctx, &args(&["a", "z", "b"])),
            RespValue::array(vec![
                RespValue::bulk_string("1"),
                RespValue::Null,
                RespValue::bulk_string("2"),
            ])
        );
        assert!(MSetCommand.check(&args(&["a", "1", "b"])).is_err());
    }
}
