//! Parser for the script language
//!
//! A Lua subset: `return`, `local` bindings and bare calls as statements;
//! literals, `KEYS`/`ARGV` indexing, table constructors and
//! `redis.call`/`redis.pcall` as expressions.

use crate::error::ScriptError;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil,
    Bool(bool),
    Int(i64),
    Str(Bytes),
    Var(String),
    Table(Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Field(Box<Expr>, String),
    Call(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Return(Option<Expr>),
    Local(String, Expr),
    Call(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    Int(i64),
    Str(Bytes),
    Sym(char),
}

fn compile_error(msg: impl Into<String>) -> ScriptError {
    ScriptError::Compile(msg.into())
}

fn tokenize(src: &str) -> Result<Vec<Token>, ScriptError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let n = src[start..i]
                    .parse::<i64>()
                    .map_err(|_| compile_error(format!("malformed number near '{}'", &src[start..i])))?;
                tokens.push(Token::Int(n));
            }
            b'"' | b'\'' => {
                let quote = c;
                let mut out = Vec::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None | Some(b'\n') => return Err(compile_error("unfinished string")),
                        Some(&b) if b == quote => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let escaped = match bytes.get(i + 1) {
                                Some(b'n') => b'\n',
                                Some(b't') => b'\t',
                                Some(b'r') => b'\r',
                                Some(&other) => other,
                                None => return Err(compile_error("unfinished string")),
                            };
                            out.push(escaped);
                            i += 2;
                        }
                        Some(&b) => {
                            out.push(b);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(Bytes::from(out)));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token::Name(src[start..i].to_string()));
            }
            b'(' | b')' | b'{' | b'}' | b'[' | b']' | b',' | b';' | b'.' | b'=' | b'-' => {
                tokens.push(Token::Sym(c as char));
                i += 1;
            }
            other => {
                return Err(compile_error(format!(
                    "unexpected symbol near '{}'",
                    other as char
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: char) -> Result<(), ScriptError> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(compile_error(format!("'{}' expected", sym)))
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Name(n)) if n == word)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            if self.eat_sym(';') {
                continue;
            }
            let stmt = self.statement()?;
            let is_return = matches!(stmt, Stmt::Return(_));
            stmts.push(stmt);
            if is_return {
                while self.eat_sym(';') {}
                if self.peek().is_some() {
                    return Err(compile_error("'<eof>' expected after return"));
                }
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        if self.is_keyword("return") {
            self.pos += 1;
            if self.peek().is_none() || self.peek() == Some(&Token::Sym(';')) {
                return Ok(Stmt::Return(None));
            }
            return Ok(Stmt::Return(Some(self.expr()?)));
        }

        if self.is_keyword("local") {
            self.pos += 1;
            let name = match self.next() {
                Some(Token::Name(name)) => name,
                _ => return Err(compile_error("<name> expected")),
            };
            self.expect_sym('=')?;
            return Ok(Stmt::Local(name, self.expr()?));
        }

        let expr = self.expr()?;
        match expr {
            Expr::Call(..) => Ok(Stmt::Call(expr)),
            _ => Err(compile_error("syntax error near expression statement")),
        }
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_sym('[') {
                let index = self.expr()?;
                self.expect_sym(']')?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_sym('.') {
                match self.next() {
                    Some(Token::Name(name)) => expr = Expr::Field(Box::new(expr), name),
                    _ => return Err(compile_error("<name> expected")),
                }
            } else if self.eat_sym('(') {
                let args = self.list(')')?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Sym('-')) => match self.next() {
                Some(Token::Int(n)) => Ok(Expr::Int(-n)),
                _ => Err(compile_error("unexpected symbol near '-'")),
            },
            Some(Token::Sym('{')) => Ok(Expr::Table(self.list('}')?)),
            Some(Token::Sym('(')) => {
                let inner = self.expr()?;
                self.expect_sym(')')?;
                Ok(inner)
            }
            Some(Token::Name(name)) => Ok(match name.as_str() {
                "nil" => Expr::Nil,
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "return" | "local" => return Err(compile_error(format!("unexpected '{}'", name))),
                _ => Expr::Var(name),
            }),
            Some(token) => Err(compile_error(format!("unexpected symbol {:?}", token))),
            None => Err(compile_error("unexpected <eof>")),
        }
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed
    fn list(&mut self, close: char) -> Result<Vec<Expr>, ScriptError> {
        let mut items = Vec::new();
        loop {
            if self.eat_sym(close) {
                return Ok(items);
            }
            items.push(self.expr()?);
            if !self.eat_sym(',') {
                self.expect_sym(close)?;
                return Ok(items);
            }
        }
    }
}

/// Parse a script body into its statements
pub fn parse(src: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = tokenize(src)?;
    Parser { tokens, pos: 0 }.block()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_call(args: Vec<Expr>) -> Expr {
        Expr::Call(
            Box::new(Expr::Field(Box::new(Expr::Var("redis".into())), "call".into())),
            args,
        )
    }

    #[test]
    fn test_parse_return_literal() {
        assert_eq!(parse("return 5").unwrap(), vec![Stmt::Return(Some(Expr::Int(5)))]);
        assert_eq!(parse("return -3;").unwrap(), vec![Stmt::Return(Some(Expr::Int(-3)))]);
        assert_eq!(parse("").unwrap(), vec![]);
    }

    #[test]
    fn test_parse_call_and_index() {
        let stmts = parse("redis.call('set', KEYS[1], ARGV[1])\nreturn redis.call('get', KEYS[1])")
            .unwrap();
        let key = Expr::Index(Box::new(Expr::Var("KEYS".into())), Box::new(Expr::Int(1)));
        let arg = Expr::Index(Box::new(Expr::Var("ARGV".into())), Box::new(Expr::Int(1)));
        assert_eq!(
            stmts[0],
            Stmt::Call(redis_call(vec![Expr::Str(Bytes::from("set")), key.clone(), arg]))
        );
        assert_eq!(
            stmts[1],
            Stmt::Return(Some(redis_call(vec![Expr::Str(Bytes::from("get")), key])))
        );
    }

    #[test]
    fn test_parse_table_and_local() {
        let stmts = parse("local t = {1, 'two', nil,}; return t").unwrap();
        assert_eq!(
            stmts[0],
            Stmt::Local(
                "t".into(),
                Expr::Table(vec![Expr::Int(1), Expr::Str(Bytes::from("two")), Expr::Nil])
            )
        );
        assert_eq!(stmts[1], Stmt::Return(Some(Expr::Var("t".into()))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("return 'open"), Err(ScriptError::Compile(_))));
        assert!(matches!(parse("return 1 return 2"), Err(ScriptError::Compile(_))));
        assert!(matches!(parse("x"), Err(ScriptError::Compile(_))));
        assert!(matches!(parse("return {1, 2"), Err(ScriptError::Compile(_))));
        assert!(matches!(parse("return 1 + 2"), Err(ScriptError::Compile(_))));
    }

    #[test]
    fn test_comments_and_escapes() {
        let stmts = parse("-- comment\nreturn \"a\\\"b\"").unwrap();
        assert_eq!(stmts, vec![Stmt::Return(Some(Expr::Str(Bytes::from("a\"b"))))]);
    }
}
