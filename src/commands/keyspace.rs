//! Whole-keyspace commands (DBSIZE, FLUSHDB, FLUSHALL, KEYS)
//!
//! These run as global transactions: one hop on every shard while holding the
//! shard lock exclusively.

use super::{Command, CommandContext, CommandKind, Merge};
use crate::protocol::RespValue;
use bytes::Bytes;

/// DBSIZE command
///
/// Syntax: DBSIZE
pub struct DbSizeCommand;

impl Command for DbSizeCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, _args: &[Bytes]) -> RespValue {
        RespValue::integer(ctx.store.len() as i64)
    }

    fn name(&self) -> &'static str {
        "DBSIZE"
    }

    fn max_args(&self) -> Option<usize> {
        Some(0)
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Global
    }

    fn merge(&self) -> Merge {
        Merge::Sum
    }
}

/// FLUSHDB command - Remove every key
///
/// Syntax: FLUSHDB [ASYNC|SYNC]
pub struct FlushDbCommand;

impl Command for FlushDbCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, _args: &[Bytes]) -> RespValue {
        ctx.store.clear();
        RespValue::ok()
    }

    fn check(&self, args: &[Bytes]) -> Result<(), RespValue> {
        check_flush_mode(args)
    }

    fn name(&self) -> &'static str {
        "FLUSHDB"
    }

    fn max_args(&self) -> Option<usize> {
        Some(1)
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Global
    }

    fn is_write(&self) -> bool {
        true
    }

    fn merge(&self) -> Merge {
        Merge::AllOk
    }
}

/// FLUSHALL command - same as FLUSHDB, there is a single database
///
/// Syntax: FLUSHALL [ASYNC|SYNC]
pub struct FlushAllCommand;

impl Command for FlushAllCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, _args: &[Bytes]) -> RespValue {
        ctx.store.clear();
        RespValue::ok()
    }

    fn check(&self, args: &[Bytes]) -> Result<(), RespValue> {
        check_flush_mode(args)
    }

    fn name(&self) -> &'static str {
        "FLUSHALL"
    }

    fn max_args(&self) -> Option<usize> {
        Some(1)
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Global
    }

    fn is_write(&self) -> bool {
        true
    }

    fn merge(&self) -> Merge {
        Merge::AllOk
    }
}

fn check_flush_mode(args: &[Bytes]) -> Result<(), RespValue> {
    match args.first() {
        None => Ok(()),
        Some(mode) if mode.eq_ignore_ascii_case(b"ASYNC") || mode.eq_ignore_ascii_case(b"SYNC") => {
            Ok(())
        }
        Some(_) => Err(RespValue::error("ERR syntax error")),
    }
}

/// KEYS command - Find all keys matching a glob pattern
///
/// Syntax: KEYS pattern
pub struct KeysCommand;

impl Command for KeysCommand {
    fn execute(&self, ctx: &mut CommandContext<'_>, args: &[Bytes]) -> RespValue {
        let pattern = &args[0];
        let keys = ctx.store.scan(|entry| glob_match(pattern, &entry.key));
        RespValue::array(keys.into_iter().map(RespValue::bulk_string).collect())
    }

    fn name(&self) -> &'static str {
        "KEYS"
    }

    fn min_args(&self) -> usize {
        1
    }

    fn max_args(&self) -> Option<usize> {
        Some(1)
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Global
    }

    fn merge(&self) -> Merge {
        Merge::Concat
    }
}

/// Redis-style glob: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes
///
/// Iterative with single-star backtracking, so hostile patterns cannot blow
/// the stack.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, len)) = match_class(&pattern[p..], text[t]) {
                        if matched {
                            p += len;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }

        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Match `ch` against the class at the start of `pattern`
///
/// Returns whether it matched and the length of the class including the
/// brackets, or `None` for an unterminated class.
fn match_class(pattern: &[u8], ch: u8) -> Option<(bool, usize)> {
    let mut i = 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < pattern.len() && pattern[i] != b']' {
        let mut lo = pattern[i];
        if lo == b'\\' && i + 1 < pattern.len() {
            i += 1;
            lo = pattern[i];
        }
        if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            let hi = pattern[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            matched |= (lo..=hi).contains(&ch);
            i += 3;
        } else {
            matched |= lo == ch;
            i += 1;
        }
    }

    if i >= pattern.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
