//! Script evaluation
//!
//! Walks the parsed statements, calling back into the host for every
//! `redis.call`/`redis.pcall`. Values convert to and from RESP replies the way
//! Redis converts between Lua and RESP.

use super::parser::{Expr, Stmt};
use crate::error::ScriptError;
use crate::protocol::RespValue;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs the commands a script issues
pub trait ScriptHost: Send {
    fn call(&mut self, args: Vec<Bytes>) -> BoxFuture<'_, Result<RespValue, ScriptError>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LuaValue {
    Nil,
    Bool(bool),
    Int(i64),
    Str(Bytes),
    Table(Vec<LuaValue>),
    /// `{ok = ...}` status table
    Status(String),
    /// `{err = ...}` error table
    Error(String),
}

impl LuaValue {
    /// Convert a command reply into a script value
    pub fn from_reply(reply: RespValue) -> LuaValue {
        match reply {
            RespValue::SimpleString(s) => LuaValue::Status(s),
            RespValue::Error(e) => LuaValue::Error(e),
            RespValue::Integer(i) => LuaValue::Int(i),
            RespValue::BulkString(b) => LuaValue::Str(b),
            RespValue::Null => LuaValue::Bool(false),
            RespValue::Array(items) => {
                LuaValue::Table(items.into_iter().map(LuaValue::from_reply).collect())
            }
        }
    }

    /// Convert the script's return value into a reply
    pub fn into_reply(self) -> RespValue {
        match self {
            LuaValue::Nil | LuaValue::Bool(false) => RespValue::Null,
            LuaValue::Bool(true) => RespValue::integer(1),
            LuaValue::Int(i) => RespValue::integer(i),
            LuaValue::Str(s) => RespValue::bulk_string(s),
            LuaValue::Status(s) => RespValue::simple_string(s),
            LuaValue::Error(e) => RespValue::error(e),
            LuaValue::Table(items) => RespValue::array(
                items
                    .into_iter()
                    .take_while(|item| *item != LuaValue::Nil)
                    .map(LuaValue::into_reply)
                    .collect(),
            ),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Bool(_) => "boolean",
            LuaValue::Int(_) => "number",
            LuaValue::Str(_) => "string",
            LuaValue::Table(_) | LuaValue::Status(_) | LuaValue::Error(_) => "table",
        }
    }
}

fn runtime_error(msg: impl Into<String>) -> ScriptError {
    ScriptError::Reply(format!("ERR Error running script: {}", msg.into()))
}

fn strings(items: &[Bytes]) -> LuaValue {
    LuaValue::Table(items.iter().cloned().map(LuaValue::Str).collect())
}

struct Interpreter<'h, H: ScriptHost> {
    host: &'h mut H,
    vars: HashMap<String, LuaValue>,
}

impl<'h, H: ScriptHost> Interpreter<'h, H> {
    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<LuaValue, ScriptError>> {
        Box::pin(async move {
            match expr {
                Expr::Nil => Ok(LuaValue::Nil),
                Expr::Bool(b) => Ok(LuaValue::Bool(*b)),
                Expr::Int(i) => Ok(LuaValue::Int(*i)),
                Expr::Str(s) => Ok(LuaValue::Str(s.clone())),
                Expr::Var(name) => Ok(self.vars.get(name).cloned().unwrap_or(LuaValue::Nil)),
                Expr::Table(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item).await?);
                    }
                    Ok(LuaValue::Table(out))
                }
                Expr::Index(base, index) => {
                    let base = self.eval(base).await?;
                    let index = self.eval(index).await?;
                    match (base, index) {
                        (LuaValue::Table(items), LuaValue::Int(i)) if i >= 1 => {
                            Ok(items.get(i as usize - 1).cloned().unwrap_or(LuaValue::Nil))
                        }
                        (LuaValue::Table(_), _) => Ok(LuaValue::Nil),
                        (other, _) => Err(runtime_error(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        ))),
                    }
                }
                Expr::Field(base, field) => match base.as_ref() {
                    Expr::Var(name) if name == "redis" => Err(runtime_error(format!(
                        "redis.{} is not supported",
                        field
                    ))),
                    _ => Err(runtime_error(format!("attempt to index field '{}'", field))),
                },
                Expr::Call(func, args) => {
                    let protected = match func.as_ref() {
                        Expr::Field(base, name) if **base == Expr::Var("redis".into()) => {
                            match name.as_str() {
                                "call" => false,
                                "pcall" => true,
                                other => {
                                    return Err(runtime_error(format!(
                                        "attempt to call field '{}' (a nil value)",
                                        other
                                    )))
                                }
                            }
                        }
                        _ => return Err(runtime_error("attempt to call a nil value")),
                    };

                    let mut argv = Vec::with_capacity(args.len());
                    for arg in args {
                        match self.eval(arg).await? {
                            LuaValue::Str(s) => argv.push(s),
                            LuaValue::Int(i) => argv.push(Bytes::from(i.to_string())),
                            _ => {
                                return Err(ScriptError::Reply(
                                    "ERR Lua redis() command arguments must be strings or integers"
                                        .to_string(),
                                ))
                            }
                        }
                    }
                    if argv.is_empty() {
                        return Err(ScriptError::Reply(
                            "ERR Please specify at least one argument for redis.call()".to_string(),
                        ));
                    }

                    match self.host.call(argv).await {
                        Ok(RespValue::Error(e)) if !protected => Err(ScriptError::Reply(e)),
                        Ok(reply) => Ok(LuaValue::from_reply(reply)),
                        Err(e) if protected => Ok(LuaValue::Error(e.to_reply())),
                        Err(e) => Err(e),
                    }
                }
            }
        })
    }
}

/// Evaluate `stmts` with `KEYS` and `ARGV` bound
pub async fn run<H: ScriptHost>(
    stmts: &[Stmt],
    keys: &[Bytes],
    argv: &[Bytes],
    host: &mut H,
) -> Result<LuaValue, ScriptError> {
    let mut interp = Interpreter {
        host,
        vars: HashMap::new(),
    };
    interp.vars.insert("KEYS".to_string(), strings(keys));
    interp.vars.insert("ARGV".to_string(), strings(argv));

    for stmt in stmts {
        match stmt {
            Stmt::Return(None) => return Ok(LuaValue::Nil),
            Stmt::Return(Some(expr)) => return interp.eval(expr).await,
            Stmt::Local(name, expr) => {
                let value = interp.eval(expr).await?;
                interp.vars.insert(name.clone(), value);
            }
            Stmt::Call(expr) => {
                interp.eval(expr).await?;
            }
        }
    }
    Ok(LuaValue::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::parser::parse;

    /// Records calls and answers from a fixed map
    struct FakeHost {
        calls: Vec<Vec<Bytes>>,
    }

    impl ScriptHost for FakeHost {
        fn call(&mut self, args: Vec<Bytes>) -> BoxFuture<'_, Result<RespValue, ScriptError>> {
            Box::pin(async move {
                let reply = match args[0].as_ref() {
                    b"get" => RespValue::bulk_string(Bytes::from("v")),
                    b"incr" => RespValue::integer(7),
                    b"set" => RespValue::ok(),
                    b"nil" => RespValue::Null,
                    b"undeclared" => {
                        return Err(ScriptError::UndeclaredKey(args[1].clone()));
                    }
                    _ => RespValue::error("ERR unknown command"),
                };
                self.calls.push(args);
                Ok(reply)
            })
        }
    }

    async fn eval(src: &str, keys: &[&str], argv: &[&str]) -> (Result<RespValue, ScriptError>, FakeHost) {
        let keys: Vec<Bytes> = keys.iter().map(|k| Bytes::copy_from_slice(k.as_bytes())).collect();
        let argv: Vec<Bytes> = argv.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect();
        let mut host = FakeHost { calls: Vec::new() };
        let stmts = parse(src).unwrap();
        let result = run(&stmts, &keys, &argv, &mut host).await.map(LuaValue::into_reply);
        (result, host)
    }

    #[tokio::test]
    async fn test_literals() {
        assert_eq!(eval("return 5", &[], &[]).await.0.unwrap(), RespValue::integer(5));
        assert_eq!(eval("return nil", &[], &[]).await.0.unwrap(), RespValue::Null);
        assert_eq!(eval("return true", &[], &[]).await.0.unwrap(), RespValue::integer(1));
        assert_eq!(
            eval("return {1, 'a', nil, 3}", &[], &[]).await.0.unwrap(),
            RespValue::array(vec![RespValue::integer(1), RespValue::bulk_string("a")])
        );
    }

    #[tokio::test]
    async fn test_keys_and_argv() {
        let (reply, host) = eval(
            "redis.call('set', KEYS[1], ARGV[1]); return redis.call('get', KEYS[1])",
            &["k"],
            &["x"],
        )
        .await;
        assert_eq!(reply.unwrap(), RespValue::bulk_string("v"));
        assert_eq!(host.calls.len(), 2);
        assert_eq!(host.calls[0], vec![Bytes::from("set"), Bytes::from("k"), Bytes::from("x")]);
    }

    #[tokio::test]
    async fn test_status_and_null_conversion() {
        assert_eq!(eval("return redis.call('set', 'a', 1)", &[], &[]).await.0.unwrap(), RespValue::ok());
        assert_eq!(eval("return redis.call('nil')", &[], &[]).await.0.unwrap(), RespValue::Null);
    }

    #[tokio::test]
    async fn test_call_error_aborts_pcall_returns() {
        let (reply, host) = eval("redis.call('bogus'); return redis.call('incr')", &[], &[]).await;
        assert_eq!(reply.unwrap_err().to_reply(), "ERR unknown command");
        assert_eq!(host.calls.len(), 1);

        let (reply, _) = eval("return redis.pcall('bogus')", &[], &[]).await;
        assert_eq!(reply.unwrap(), RespValue::error("ERR unknown command"));
    }

    #[tokio::test]
    async fn test_host_error_propagates() {
        let (reply, _) = eval("return redis.call('undeclared', 'x')", &[], &[]).await;
        assert_eq!(
            reply.unwrap_err().to_reply(),
            "ERR script tried accessing undeclared key: x"
        );
    }

    #[tokio::test]
    async fn test_bad_call_arguments() {
        let (reply, host) = eval("return redis.call('get', {})", &[], &[]).await;
        assert!(reply.is_err());
        assert!(host.calls.is_empty());
        assert!(eval("return KEYS[1][1]", &[], &[]).await.0.is_err());
    }
}
