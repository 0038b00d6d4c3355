//! Web interface module
//!
//! HTTP diagnostics for a running server: process and keyspace statistics,
//! per-shard counters, lock state, and a one-shot command endpoint.

mod handlers;
mod server;

pub use handlers::{CommandRequest, CommandResponse, LockReport, SystemStats};
pub use server::{router, run_web_server};
