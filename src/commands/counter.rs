//! Counter commands (INCR, INCRBY, DECR, DECRBY)

use super::{not_an_integer, parse_i64, Command, CommandContext};
use crate::protocol::RespValue;
use crate::store::Value;
use bytes::Bytes;

/// Add `delta` to the integer stored at `key`, creating it at 0
fn apply_delta(ctx: &mut CommandContext<'_>, key: &Bytes, delta: i64) -> RespValue {
    match ctx.store.get_mut(key) {
        Some(value) => {
            let current = match value.as_integer() {
                Some(i) => i,
                None => return not_an_integer(),
            };
            match current.checked_add(delta) {
                Some(next) => {
                    *value = Value::Integer(next);
                    RespValue::integer(next)
                }
                None => RespValue::error("ERR increment or decrement would overflow"),
            }
        }
        None => {
            ctx.store.set(key.clone(), Value::Integer(delta));
            RespValue::integer(delta)
        }
    }
}

/// INCR command - Increment the integer value of a key by 1
///
/// Syntax: INCR key
pub struct IncrCommand;

impl Command for IncrCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        apply_delta(ctx, &args[0], 1)
    }

    fn name(&self) -> &'static str {
        "INCR"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn max_args(&self) -> Option<usize> {
        Some(1)
    }

    fn is_write(&self) -> bool {
        true
    }
}

/// INCRBY command
///
/// Syntax: INCRBY key increment
pub struct IncrByCommand;

impl Command for IncrByCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        match parse_i64(&args[1]) {
            Some(delta) => apply_delta(ctx, &args[0], delta),
            None => not_an_integer(),
        }
    }

    fn check(&self, args: &[Bytes]) -> Result<(), RespValue> {
        parse_i64(&args[1]).map(|_| ()).ok_or_else(not_an_integer)
    }

    fn name(&self) -> &'static str {
        "INCRBY"
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

/// DECR command - Decrement the integer value of a key by 1
///
/// Syntax: DECR key
pub struct DecrCommand;

impl Command for DecrCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        apply_delta(ctx, &args[0], -1)
    }

    fn name(&self) -> &'static str {
        "DECR"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn max_args(&self) -> Option<usize> {
        Some(1)
    }

    fn is_write(&self) -> bool {
        true
    }
}

/// DECRBY command
///
/// Syntax: DECRBY key decrement
pub struct DecrByCommand;

impl Command for DecrByCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        match parse_i64(&args[1]).and_then(|d| d.checked_neg()) {
            Some(delta) => apply_delta(ctx, &args[0], delta),
            None => not_an_integer(),
        }
    }

    fn check(&self, args: &[Bytes]) -> Result<(), RespValue> {
        parse_i64(&args[1]).map(|_| ()).ok_or_else(not_an_integer)
    }

    fn name(&self) -> &'static str {
        "DECRBY"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_incr_decr() {
        let mut store = MemoryStore::new();
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(IncrCommand.execute(&mut ctx, &args(&["c"])), RespValue::integer(1));
        assert_eq!(IncrByCommand.execute(&mut ctx, &args(&["c", "10"])), RespValue::integer(11));
        assert_eq!(DecrCommand.execute(&mut ctx, &args(&["c"])), RespValue::integer(10));
        assert_eq!(DecrByCommand.execute(&mut ctx, &args(&["c", "15"])), RespValue::integer(-5));
    }

    #[test]
    fn test_incr_string_value() {
        let mut store = MemoryStore::new();
        store.set("n", Value::string("41"));
        store.set("s", Value::string("abc"));
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(IncrCommand.execute(&mut ctx, &args(&["n"])), RespValue::integer(42));
        assert!(IncrCommand.execute(&mut ctx, &args(&["s"])).is_error());
    }

    #[test]
    fn test_overflow() {
        let mut store = MemoryStore::new();
        store.set("max", Value::integer(i64::MAX));
        let mut ctx = CommandContext::new(0, &mut store);

        assert_eq!(
            IncrCommand.execute(&mut ctx, &args(&["max"])),
            RespValue::error("ERR increment or decrement would overflow")
        );
        assert!(DecrByCommand.check(&args(&["k", "x"])).is_err());
    }
}
