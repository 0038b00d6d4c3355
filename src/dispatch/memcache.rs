//! memcached requests
//!
//! Each storage or retrieval request becomes a single-hop transaction routed
//! by the same scheduler as RESP commands.

use super::{ConnectionContext, Service};
use crate::cluster::{LockMode, ShardId};
use crate::commands::CommandContext;
use crate::error::TxError;
use crate::protocol::{McCommand, McReply, McStoreMode, McValue};
use crate::store::Value;
use crate::transaction::KeySet;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::warn;

fn single_key(key: &Bytes, mode: LockMode) -> KeySet {
    let mut keys = KeySet::new();
    keys.add(key.clone(), mode);
    keys
}

fn concat(first: &[u8], second: &[u8]) -> Bytes {
    let mut joined = BytesMut::with_capacity(first.len() + second.len());
    joined.extend_from_slice(first);
    joined.extend_from_slice(second);
    joined.freeze()
}

fn store(ctx: &mut CommandContext<'_>, mode: McStoreMode, key: &Bytes, flags: u32, data: &Bytes) -> McReply {
    let existing = ctx
        .store
        .get_entry(key)
        .map(|entry| (entry.value.to_bytes(), entry.flags));

    let (value, flags) = match (mode, existing) {
        (McStoreMode::Set, _) | (McStoreMode::Add, None) | (McStoreMode::Replace, Some(_)) => {
            (data.clone(), flags)
        }
        (McStoreMode::Append, Some((old, old_flags))) => (concat(&old, data), old_flags),
        (McStoreMode::Prepend, Some((old, old_flags))) => (concat(data, &old), old_flags),
        _ => return McReply::NotStored,
    };
    ctx.store.set_with_flags(key.clone(), Value::from_bytes(value), flags);
    McReply::Stored
}

fn incr(ctx: &mut CommandContext<'_>, key: &Bytes, delta: u64, decr: bool) -> McReply {
    let current = match ctx.store.get(key) {
        Some(value) => std::str::from_utf8(&value.to_bytes())
            .ok()
            .and_then(|s| s.parse::<u64>().ok()),
        None => return McReply::NotFound,
    };
    let current = match current {
        Some(n) => n,
        None => {
            return McReply::ClientError(
                "cannot increment or decrement non-numeric value".to_string(),
            )
        }
    };

    // memcached wraps on incr and floors at zero on decr
    let next = if decr {
        current.saturating_sub(delta)
    } else {
        current.wrapping_add(delta)
    };
    if let Some(value) = ctx.store.get_mut(key) {
        *value = Value::from_bytes(Bytes::from(next.to_string()));
    }
    McReply::Number(next)
}

impl Service {
    /// Execute one memcached request; `None` means the client asked to quit
    pub async fn dispatch_memcache(
        &self,
        conn: &mut ConnectionContext,
        cmd: McCommand,
    ) -> Option<McReply> {
        let result = match cmd {
            McCommand::Quit => return None,
            McCommand::Version => Ok(McReply::Version(env!("CARGO_PKG_VERSION").to_string())),
            McCommand::Store {
                mode,
                key,
                flags,
                data,
                ..
            } => {
                let keys = single_key(&key, LockMode::Exclusive);
                self.single_hop(conn, keys, move |ctx| store(ctx, mode, &key, flags, &data))
                    .await
                    .map(first_reply)
            }
            McCommand::Get { keys, with_cas } => self.get(conn, keys, with_cas).await,
            McCommand::Delete { key, .. } => {
                let keys = single_key(&key, LockMode::Exclusive);
                self.single_hop(conn, keys, move |ctx| {
                    if ctx.store.delete(&key) {
                        McReply::Deleted
                    } else {
                        McReply::NotFound
                    }
                })
                .await
                .map(first_reply)
            }
            McCommand::Incr {
                key, delta, decr, ..
            } => {
                let keys = single_key(&key, LockMode::Exclusive);
                self.single_hop(conn, keys, move |ctx| incr(ctx, &key, delta, decr))
                    .await
                    .map(first_reply)
            }
            McCommand::FlushAll { .. } => self
                .single_hop(conn, KeySet::global(), |ctx| {
                    ctx.store.clear();
                })
                .await
                .map(|_| McReply::Ok),
        };

        Some(result.unwrap_or_else(|e| {
            warn!("memcached request failed: {}", e);
            McReply::ServerError(e.to_string())
        }))
    }

    async fn get(
        &self,
        conn: &mut ConnectionContext,
        keys: Vec<Bytes>,
        with_cas: bool,
    ) -> Result<McReply, TxError> {
        let mut key_set = KeySet::new();
        for key in &keys {
            key_set.add(key.clone(), LockMode::Shared);
        }

        let lookup = keys.clone();
        let per_shard = self
            .single_hop(conn, key_set, move |ctx| {
                lookup
                    .iter()
                    .filter_map(|key| {
                        ctx.store.get_entry(key).map(|entry| McValue {
                            key: key.clone(),
                            flags: entry.flags,
                            data: entry.value.to_bytes(),
                            cas: with_cas.then_some(entry.version),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        let found: HashMap<Bytes, McValue> = per_shard
            .into_iter()
            .flat_map(|(_, values)| values)
            .map(|value| (value.key.clone(), value))
            .collect();
        let values = keys
            .iter()
            .filter_map(|key| found.get(key).cloned())
            .collect();
        Ok(McReply::Values(values))
    }

    async fn single_hop<F, R>(
        &self,
        conn: &mut ConnectionContext,
        keys: KeySet,
        f: F,
    ) -> Result<Vec<(ShardId, R)>, TxError>
    where
        F: Fn(&mut CommandContext<'_>) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let mut handle = self.scheduler.begin(keys);
        let result = handle.execute(true, f).await;
        conn.record(&handle);
        result
    }
}

fn first_reply(replies: Vec<(ShardId, McReply)>) -> McReply {
    replies
        .into_iter()
        .next()
        .map(|(_, reply)| reply)
        .unwrap_or_else(|| McReply::ServerError("no shard replied".to_string()))
}
