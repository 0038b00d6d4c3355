//! Command dispatcher
//!
//! `Service` is shared by every connection. It turns a request into a
//! transaction over the keys it touches, drives the transaction's hops and
//! merges the per-shard replies. Connection state (MULTI queue, client name,
//! what the last transaction looked like) lives in `ConnectionContext`.

mod exec;
mod memcache;

use crate::cluster::{LockMode, ShardSet, TxId};
use crate::commands::{check_arity, parse_i64, wrong_args, CommandKind, CommandRegistry};
use crate::error::{ScriptError, TxError};
use crate::protocol::RespValue;
use crate::scripting::{self, Script, ScriptCache, ScriptHost};
use crate::transaction::{KeySet, TxHandle, TxScheduler};
use bytes::Bytes;
use exec::{run_invocations, Invocation};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// What the last transaction of a connection looked like
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugInfo {
    /// Shards the transaction participated in
    pub shards_count: usize,
    pub txid: TxId,
    /// Whether it ran out of order
    pub ooo: bool,
}

enum Queued {
    Data(Invocation),
    /// Keyless commands are answered at queue time
    Ready(RespValue),
}

/// Per-connection state
#[derive(Default)]
pub struct ConnectionContext {
    multi: Option<Vec<Queued>>,
    poisoned: bool,
    name: Option<Bytes>,
    last: DebugInfo,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_multi(&self) -> bool {
        self.multi.is_some()
    }

    pub fn debug_info(&self) -> DebugInfo {
        self.last
    }

    fn record(&mut self, handle: &TxHandle) {
        self.last = DebugInfo {
            shards_count: handle.shard_count(),
            txid: handle.id(),
            ooo: handle.is_ooo(),
        };
    }

    fn poison(&mut self, reply: RespValue) -> RespValue {
        self.poisoned = true;
        reply
    }
}

/// Commands handled here rather than on the shards
const CONNECTION_COMMANDS: &[&str] = &[
    "MULTI", "EXEC", "DISCARD", "EVAL", "EVALSHA", "SCRIPT", "INFO", "CLIENT", "COMMAND",
];

/// Commands with no keys and no side effects, answered on the spot
fn keyless(name: &str, args: &[Bytes]) -> Option<RespValue> {
    let reply = match name {
        "PING" => match args {
            [] => RespValue::simple_string("PONG"),
            [msg] => RespValue::bulk_string(msg.clone()),
            _ => wrong_args(name),
        },
        "ECHO" => match args {
            [msg] => RespValue::bulk_string(msg.clone()),
            _ => wrong_args(name),
        },
        _ => return None,
    };
    Some(reply)
}

fn tx_error(e: TxError) -> RespValue {
    warn!("Transaction failed: {}", e);
    RespValue::error(format!("ERR {}", e))
}

/// Entry point shared by all connections
pub struct Service {
    scheduler: Arc<TxScheduler>,
    registry: CommandRegistry,
    scripts: ScriptCache,
    started: Instant,
}

impl Service {
    pub fn new(shards: Arc<ShardSet>) -> Self {
        Service {
            scheduler: Arc::new(TxScheduler::new(shards)),
            registry: CommandRegistry::new(),
            scripts: ScriptCache::new(),
            started: Instant::now(),
        }
    }

    pub fn shard_set(&self) -> &Arc<ShardSet> {
        self.scheduler.shard_set()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn scripts(&self) -> &ScriptCache {
        &self.scripts
    }

    /// Whether `key` currently has a lock entry on its shard
    pub async fn is_locked(&self, key: &[u8]) -> Result<bool, TxError> {
        let shards = self.shard_set();
        shards.is_locked(shards.shard_for(key), key).await
    }

    /// Whether any shard holds any lock
    pub async fn is_shard_set_locked(&self) -> Result<bool, TxError> {
        self.shard_set().is_any_shard_locked().await
    }

    /// Execute one RESP request (command name followed by its arguments)
    pub async fn dispatch(&self, conn: &mut ConnectionContext, mut parts: Vec<Bytes>) -> RespValue {
        if parts.is_empty() {
            return RespValue::error("ERR empty command");
        }
        let raw_name = parts.remove(0);
        let args = parts;
        let name = String::from_utf8_lossy(&raw_name).to_ascii_uppercase();
        debug!("Dispatching command: {}", name);

        if conn.in_multi() {
            return self.queue(conn, &name, &raw_name, args).await;
        }

        match name.as_str() {
            "MULTI" => {
                conn.multi = Some(Vec::new());
                conn.poisoned = false;
                RespValue::ok()
            }
            "EXEC" => RespValue::error("ERR EXEC without MULTI"),
            "DISCARD" => RespValue::error("ERR DISCARD without MULTI"),
            "EVAL" => self.eval(conn, &args).await,
            "EVALSHA" => self.evalsha(conn, &args).await,
            "SCRIPT" => self.script(&args),
            "INFO" => self.info().await,
            "CLIENT" => client(conn, &args),
            "COMMAND" => self.command(&args),
            _ => {
                if let Some(reply) = keyless(&name, &args) {
                    return reply;
                }
                match Invocation::resolve(&self.registry, &name, args) {
                    Some(Ok(inv)) => self.run_single(conn, inv).await,
                    Some(Err(reply)) => reply,
                    None => unknown_command(&raw_name),
                }
            }
        }
    }

    async fn run_single(&self, conn: &mut ConnectionContext, inv: Invocation) -> RespValue {
        let mut handle = self.scheduler.begin(inv.keys());
        let result = run_invocations(&mut handle, self.shard_set().router(), vec![inv], true).await;
        conn.record(&handle);
        match result {
            Ok(mut replies) => replies.pop().unwrap_or(RespValue::Null),
            Err(e) => tx_error(e),
        }
    }

    /// Handle a request while the connection is inside MULTI
    async fn queue(
        &self,
        conn: &mut ConnectionContext,
        name: &str,
        raw_name: &Bytes,
        args: Vec<Bytes>,
    ) -> RespValue {
        let queued = match name {
            "EXEC" => return self.exec(conn).await,
            "DISCARD" => {
                conn.multi = None;
                conn.poisoned = false;
                return RespValue::ok();
            }
            "MULTI" => return RespValue::error("ERR MULTI calls can not be nested"),
            _ if CONNECTION_COMMANDS.contains(&name) => {
                return conn.poison(RespValue::error(format!(
                    "ERR Command not allowed inside a transaction: '{}'",
                    name.to_ascii_lowercase()
                )))
            }
            _ => match keyless(name, &args) {
                Some(reply) if reply.is_error() => return conn.poison(reply),
                Some(reply) => Queued::Ready(reply),
                None => match Invocation::resolve(&self.registry, name, args) {
                    Some(Ok(inv)) => Queued::Data(inv),
                    Some(Err(reply)) => return conn.poison(reply),
                    None => return conn.poison(unknown_command(raw_name)),
                },
            },
        };

        if let Some(batch) = conn.multi.as_mut() {
            batch.push(queued);
        }
        RespValue::simple_string("QUEUED")
    }

    async fn exec(&self, conn: &mut ConnectionContext) -> RespValue {
        let batch = conn.multi.take().unwrap_or_default();
        if std::mem::take(&mut conn.poisoned) {
            return RespValue::error("EXECABORT Transaction discarded because of previous errors.");
        }

        let mut keys = KeySet::new();
        let mut invocations = Vec::new();
        let mut replies: Vec<Option<RespValue>> = Vec::with_capacity(batch.len());
        for queued in batch {
            match queued {
                Queued::Data(inv) => {
                    keys.merge(inv.keys());
                    invocations.push(inv);
                    replies.push(None);
                }
                Queued::Ready(reply) => replies.push(Some(reply)),
            }
        }

        let mut results = if invocations.is_empty() {
            Vec::new().into_iter()
        } else {
            let mut handle = self.scheduler.begin(keys);
            let result =
                run_invocations(&mut handle, self.shard_set().router(), invocations, true).await;
            conn.record(&handle);
            match result {
                Ok(results) => results.into_iter(),
                Err(e) => return tx_error(e),
            }
        };

        RespValue::array(
            replies
                .into_iter()
                .map(|slot| slot.or_else(|| results.next()).unwrap_or(RespValue::Null))
                .collect(),
        )
    }

    async fn eval(&self, conn: &mut ConnectionContext, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_args("eval");
        }
        match self.scripts.load(&String::from_utf8_lossy(&args[0])) {
            Ok(script) => self.run_script(conn, script, &args[1..]).await,
            Err(e) => RespValue::error(e.to_reply()),
        }
    }

    async fn evalsha(&self, conn: &mut ConnectionContext, args: &[Bytes]) -> RespValue {
        if args.len() < 2 {
            return wrong_args("evalsha");
        }
        match self.scripts.get(&String::from_utf8_lossy(&args[0])) {
            Some(script) => self.run_script(conn, script, &args[1..]).await,
            None => RespValue::error("NOSCRIPT No matching script. Please use EVAL."),
        }
    }

    /// Run `script` as one transaction over its declared keys
    async fn run_script(
        &self,
        conn: &mut ConnectionContext,
        script: Arc<Script>,
        args: &[Bytes],
    ) -> RespValue {
        let numkeys = match parse_i64(&args[0]) {
            Some(n) if n < 0 => return RespValue::error("ERR Number of keys can't be negative"),
            Some(n) => n as usize,
            None => return RespValue::error("ERR value is not an integer or out of range"),
        };
        if numkeys > args.len() - 1 {
            return RespValue::error("ERR Number of keys can't be greater than number of args");
        }
        let keys = &args[1..=numkeys];
        let argv = &args[numkeys + 1..];

        let mut declared = KeySet::new();
        for key in keys {
            declared.add(key.clone(), LockMode::Exclusive);
        }

        debug!("Running script {} over {} keys", script.sha(), keys.len());
        let mut handle = self.scheduler.begin(declared);
        let result = {
            let mut host = ScriptCall {
                service: self,
                handle: &mut handle,
            };
            scripting::run(script.statements(), keys, argv, &mut host).await
        };
        let concluded = handle.conclude().await;
        conn.record(&handle);

        if let Err(e) = concluded {
            return tx_error(e);
        }
        match result {
            Ok(value) => value.into_reply(),
            Err(e) => RespValue::error(e.to_reply()),
        }
    }

    /// One `redis.call` from inside a running script
    async fn script_call(
        &self,
        handle: &mut TxHandle,
        mut args: Vec<Bytes>,
    ) -> Result<RespValue, ScriptError> {
        let name = String::from_utf8_lossy(&args.remove(0)).to_ascii_uppercase();
        if let Some(reply) = keyless(&name, &args) {
            return Ok(reply);
        }

        let cmd = match self.registry.get(&name) {
            Some(cmd) => cmd,
            None if CONNECTION_COMMANDS.contains(&name.as_str()) => {
                return Err(ScriptError::NotAllowed)
            }
            None => return Err(ScriptError::UnknownCommand),
        };
        if cmd.kind() == CommandKind::Global {
            return Err(ScriptError::NotAllowed);
        }
        if check_arity(cmd.as_ref(), &args).is_err() {
            return Err(ScriptError::WrongArity);
        }
        if let Err(reply) = cmd.check(&args) {
            return Ok(reply);
        }

        let inv = Invocation { cmd, args };
        if let Some(key) = inv.keys().keys().find(|k| !handle.keys().contains(k)) {
            return Err(ScriptError::UndeclaredKey(key.clone()));
        }

        let mut replies =
            run_invocations(handle, self.shard_set().router(), vec![inv], false).await?;
        Ok(replies.pop().unwrap_or(RespValue::Null))
    }

    fn script(&self, args: &[Bytes]) -> RespValue {
        let sub = match args.first() {
            Some(sub) => String::from_utf8_lossy(sub).to_ascii_uppercase(),
            None => return wrong_args("script"),
        };
        match (sub.as_str(), &args[1..]) {
            ("LOAD", [body]) => match self.scripts.load(&String::from_utf8_lossy(body)) {
                Ok(script) => RespValue::bulk_string(script.sha().to_string()),
                Err(e) => RespValue::error(e.to_reply()),
            },
            ("EXISTS", shas) if !shas.is_empty() => RespValue::array(
                shas.iter()
                    .map(|sha| {
                        let found = self.scripts.exists(&String::from_utf8_lossy(sha));
                        RespValue::integer(found as i64)
                    })
                    .collect(),
            ),
            ("FLUSH", rest) if rest.len() <= 1 => {
                self.scripts.flush();
                RespValue::ok()
            }
            ("LOAD", _) | ("EXISTS", _) | ("FLUSH", _) => wrong_args("script"),
            _ => RespValue::error(format!("ERR unknown subcommand '{}'", sub)),
        }
    }

    async fn info(&self) -> RespValue {
        let stats = match self.shard_set().shard_stats().await {
            Ok(stats) => stats,
            Err(e) => return tx_error(e),
        };

        let mut info = format!(
            "# Server\r\n\
            hopdb_version:{}\r\n\
            os:{}\r\n\
            arch:{}\r\n\
            uptime_in_seconds:{}\r\n\
            \r\n\
            # Shards\r\n\
            shards:{}\r\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
            self.started.elapsed().as_secs(),
            stats.len()
        );
        for s in &stats {
            info.push_str(&format!(
                "shard{}:keys={},txq={},locks={},ooo_hops={},queued_hops={}\r\n",
                s.shard_id, s.keys, s.txq_len, s.lock_entries, s.ooo_hops, s.queued_hops
            ));
        }
        let keys: usize = stats.iter().map(|s| s.keys).sum();
        let memory: usize = stats.iter().map(|s| s.memory_bytes).sum();
        info.push_str(&format!(
            "\r\n# Memory\r\nused_memory:{}\r\n\r\n# Keyspace\r\ndb0:keys={}\r\n",
            memory, keys
        ));

        RespValue::bulk_string(info)
    }

    fn command(&self, args: &[Bytes]) -> RespValue {
        match args.first() {
            Some(sub) if sub.eq_ignore_ascii_case(b"COUNT") => {
                RespValue::integer(self.registry.command_names().len() as i64)
            }
            // Clients send COMMAND DOCS on connect
            Some(_) => RespValue::array(Vec::new()),
            None => RespValue::array(
                self.registry
                    .command_names()
                    .into_iter()
                    .map(|name| RespValue::bulk_string(name.to_ascii_lowercase()))
                    .collect(),
            ),
        }
    }
}

/// CLIENT SETNAME / GETNAME / SETINFO
fn client(conn: &mut ConnectionContext, args: &[Bytes]) -> RespValue {
    let sub = match args.first() {
        Some(sub) => String::from_utf8_lossy(sub).to_ascii_uppercase(),
        None => return wrong_args("client"),
    };
    match (sub.as_str(), &args[1..]) {
        ("SETNAME", [name]) => {
            conn.name = Some(name.clone());
            RespValue::ok()
        }
        ("GETNAME", []) => match &conn.name {
            Some(name) => RespValue::bulk_string(name.clone()),
            None => RespValue::Null,
        },
        ("SETINFO", [_, _]) => RespValue::ok(),
        _ => RespValue::error(format!("ERR unknown subcommand '{}'", sub)),
    }
}

fn unknown_command(raw_name: &[u8]) -> RespValue {
    warn!("Unknown command: {}", String::from_utf8_lossy(raw_name));
    RespValue::error(format!(
        "ERR unknown command '{}'",
        String::from_utf8_lossy(raw_name)
    ))
}

/// Answers a script's `redis.call`s inside its transaction
struct ScriptCall<'a> {
    service: &'a Service,
    handle: &'a mut TxHandle,
}

impl ScriptHost for ScriptCall<'_> {
    fn call(
        &mut self,
        args: Vec<Bytes>,
    ) -> Pin<Box<dyn Future<Output = Result<RespValue, ScriptError>> + Send + '_>> {
        Box::pin(self.service.script_call(&mut *self.handle, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardSetConfig;

    fn service(num_shards: usize) -> Service {
        let shards = ShardSet::new(&ShardSetConfig {
            num_shards,
            lock_on_hashtags: false,
        })
        .unwrap();
        Service::new(Arc::new(shards))
    }

    fn cmd(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[tokio::test]
    async fn test_dispatch_set_get() {
        let service = service(2);
        let mut conn = ConnectionContext::new();

        let reply = service.dispatch(&mut conn, cmd(&["SET", "mykey", "myvalue"])).await;
        assert_eq!(reply, RespValue::ok());

        let reply = service.dispatch(&mut conn, cmd(&["get", "mykey"])).await;
        assert_eq!(reply, RespValue::bulk_string("myvalue"));
        assert_eq!(conn.debug_info().shards_count, 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_and_arity() {
        let service = service(1);
        let mut conn = ConnectionContext::new();

        let reply = service.dispatch(&mut conn, cmd(&["NOPE"])).await;
        assert_eq!(reply, RespValue::error("ERR unknown command 'NOPE'"));

        let reply = service.dispatch(&mut conn, cmd(&["GET"])).await;
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_keyless_commands() {
        let service = service(1);
        let mut conn = ConnectionContext::new();

        assert_eq!(
            service.dispatch(&mut conn, cmd(&["PING"])).await,
            RespValue::simple_string("PONG")
        );
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["ECHO", "hi"])).await,
            RespValue::bulk_string("hi")
        );
        assert_eq!(conn.debug_info(), DebugInfo::default());
    }

    #[tokio::test]
    async fn test_multi_errors() {
        let service = service(1);
        let mut conn = ConnectionContext::new();

        assert_eq!(
            service.dispatch(&mut conn, cmd(&["EXEC"])).await,
            RespValue::error("ERR EXEC without MULTI")
        );
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["DISCARD"])).await,
            RespValue::error("ERR DISCARD without MULTI")
        );

        service.dispatch(&mut conn, cmd(&["MULTI"])).await;
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["MULTI"])).await,
            RespValue::error("ERR MULTI calls can not be nested")
        );
        assert!(service.dispatch(&mut conn, cmd(&["GET"])).await.is_error());
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["SET", "a", "1"])).await,
            RespValue::simple_string("QUEUED")
        );
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["EXEC"])).await,
            RespValue::error("EXECABORT Transaction discarded because of previous errors.")
        );
        assert!(!conn.in_multi());

        // Nothing from the aborted batch ran
        assert_eq!(service.dispatch(&mut conn, cmd(&["GET", "a"])).await, RespValue::Null);
    }

    #[tokio::test]
    async fn test_discard() {
        let service = service(1);
        let mut conn = ConnectionContext::new();

        service.dispatch(&mut conn, cmd(&["MULTI"])).await;
        service.dispatch(&mut conn, cmd(&["SET", "a", "1"])).await;
        assert_eq!(service.dispatch(&mut conn, cmd(&["DISCARD"])).await, RespValue::ok());
        assert_eq!(service.dispatch(&mut conn, cmd(&["EXISTS", "a"])).await, RespValue::integer(0));
    }

    #[tokio::test]
    async fn test_script_subcommands() {
        let service = service(1);
        let mut conn = ConnectionContext::new();

        let sha = match service.dispatch(&mut conn, cmd(&["SCRIPT", "LOAD", "return 5"])).await {
            RespValue::BulkString(sha) => String::from_utf8(sha.to_vec()).unwrap(),
            other => panic!("unexpected reply {:?}", other),
        };
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["SCRIPT", "EXISTS", &sha, "ffff"])).await,
            RespValue::array(vec![RespValue::integer(1), RespValue::integer(0)])
        );
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["EVALSHA", &sha.to_uppercase(), "0"])).await,
            RespValue::integer(5)
        );
        assert_eq!(service.dispatch(&mut conn, cmd(&["SCRIPT", "FLUSH"])).await, RespValue::ok());
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["EVALSHA", &sha, "0"])).await,
            RespValue::error("NOSCRIPT No matching script. Please use EVAL.")
        );
    }

    #[tokio::test]
    async fn test_eval_numkeys_validation() {
        let service = service(1);
        let mut conn = ConnectionContext::new();

        assert_eq!(
            service.dispatch(&mut conn, cmd(&["EVAL", "return 1", "2", "a"])).await,
            RespValue::error("ERR Number of keys can't be greater than number of args")
        );
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["EVAL", "return 1", "x"])).await,
            RespValue::error("ERR value is not an integer or out of range")
        );
    }

    #[tokio::test]
    async fn test_script_rejects_global_commands() {
        let service = service(2);
        let mut conn = ConnectionContext::new();

        let reply = service
            .dispatch(&mut conn, cmd(&["EVAL", "return redis.call('flushall')", "0"]))
            .await;
        assert_eq!(
            reply,
            RespValue::error("ERR This Redis command is not allowed from scripts")
        );
        assert!(!service.is_shard_set_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_client_name() {
        let service = service(1);
        let mut conn = ConnectionContext::new();

        assert_eq!(service.dispatch(&mut conn, cmd(&["CLIENT", "GETNAME"])).await, RespValue::Null);
        service.dispatch(&mut conn, cmd(&["CLIENT", "SETNAME", "worker"])).await;
        assert_eq!(
            service.dispatch(&mut conn, cmd(&["client", "getname"])).await,
            RespValue::bulk_string("worker")
        );
    }

    #[tokio::test]
    async fn test_info_lists_shards() {
        let service = service(3);
        let mut conn = ConnectionContext::new();
        match service.dispatch(&mut conn, cmd(&["INFO"])).await {
            RespValue::BulkString(info) => {
                let text = String::from_utf8(info.to_vec()).unwrap();
                assert!(text.contains("shards:3"));
                assert!(text.contains("shard2:"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
