//! Server-side scripting
//!
//! Scripts are compiled once and cached by the SHA1 of their body. Running a
//! script is driven by the dispatcher, which wraps it in one transaction over
//! the declared keys and answers its `redis.call`s.

mod interp;
mod parser;

pub use interp::{run, LuaValue, ScriptHost};

use crate::error::ScriptError;
use parking_lot::RwLock;
use parser::Stmt;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled script
#[derive(Debug)]
pub struct Script {
    sha: String,
    stmts: Vec<Stmt>,
}

impl Script {
    /// Compile `body`
    pub fn compile(body: &str) -> Result<Self, ScriptError> {
        Ok(Script {
            sha: script_sha(body),
            stmts: parser::parse(body)?,
        })
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    pub(crate) fn statements(&self) -> &[Stmt] {
        &self.stmts
    }
}

/// Lowercase hex SHA1 of the trimmed body
pub fn script_sha(body: &str) -> String {
    Sha1::digest(body.trim().as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Compiled scripts shared by every connection
#[derive(Default)]
pub struct ScriptCache {
    scripts: RwLock<HashMap<String, Arc<Script>>>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and cache `body`, returning the cached copy if already loaded
    pub fn load(&self, body: &str) -> Result<Arc<Script>, ScriptError> {
        let sha = script_sha(body);
        if let Some(script) = self.scripts.read().get(&sha) {
            return Ok(script.clone());
        }

        let script = Arc::new(Script::compile(body)?);
        self.scripts.write().insert(sha, script.clone());
        Ok(script)
    }

    /// Look up by digest, ignoring case
    pub fn get(&self, sha: &str) -> Option<Arc<Script>> {
        self.scripts.read().get(&sha.to_ascii_lowercase()).cloned()
    }

    pub fn exists(&self, sha: &str) -> bool {
        self.scripts.read().contains_key(&sha.to_ascii_lowercase())
    }

    pub fn flush(&self) {
        self.scripts.write().clear();
    }

    pub fn len(&self) -> usize {
        self.scripts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
