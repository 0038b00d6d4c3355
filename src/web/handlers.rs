//! HTTP handlers for the diagnostics interface

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, warn};

use crate::cluster::ShardStats;
use crate::dispatch::{ConnectionContext, DebugInfo, Service};
use crate::protocol::RespValue;

/// Shared application state
pub type AppState = Arc<Service>;

/// Request body for command execution
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    /// The command as a string, e.g., "SET key value"
    pub command: String,
}

/// Response for command execution
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    /// Whether the command succeeded
    pub success: bool,
    /// The result or error message
    pub result: String,
    /// Shards touched by the command's transaction
    pub shards: usize,
    /// Whether that transaction ran out of order
    pub ooo: bool,
}

/// System statistics response
#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub total_memory_mb: f64,
    pub used_memory_mb: f64,
    pub free_memory_mb: f64,
    /// CPU usage percentage (0-100)
    pub cpu_usage: f64,
    /// Memory held by all shard stores
    pub db_memory_mb: f64,
    pub keys: usize,
    pub shards: usize,
}

/// Lock and queue state of the shard set
#[derive(Debug, Serialize)]
pub struct LockReport {
    pub any_locked: bool,
    pub txq_lengths: Vec<usize>,
    pub lock_entries: Vec<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn unavailable(e: impl std::fmt::Display) -> (StatusCode, Json<ErrorBody>) {
    warn!("Diagnostics request failed: {}", e);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
}

/// Execute a command
pub async fn execute_command(
    State(service): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    let (status, body) = run_command(&service, &req.command).await;
    (status, Json(body))
}

/// Run a whitespace-separated command through a throwaway connection
pub(crate) async fn run_command(service: &Service, command: &str) -> (StatusCode, CommandResponse) {
    debug!("Executing command: {}", command);

    let parts: Vec<Bytes> = command
        .split_whitespace()
        .map(|s| Bytes::from(s.to_string()))
        .collect();

    if parts.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            CommandResponse {
                success: false,
                result: "Empty command".to_string(),
                shards: 0,
                ooo: false,
            },
        );
    }

    let mut conn = ConnectionContext::new();
    let response = service.dispatch(&mut conn, parts).await;
    let DebugInfo { shards_count, ooo, .. } = conn.debug_info();

    (
        StatusCode::OK,
        CommandResponse {
            success: !response.is_error(),
            result: format_resp_value(&response),
            shards: shards_count,
            ooo,
        },
    )
}

/// Format a RESP value for display
fn format_resp_value(value: &RespValue) -> String {
    match value {
        RespValue::SimpleString(s) => s.clone(),
        RespValue::Error(e) => format!("Error: {}", e),
        RespValue::Integer(i) => i.to_string(),
        RespValue::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        RespValue::Array(arr) if arr.is_empty() => "(empty array)".to_string(),
        RespValue::Array(arr) => arr
            .iter()
            .enumerate()
            .map(|(i, v)| format!("{}) {}", i + 1, format_resp_value(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        RespValue::Null => "(nil)".to_string(),
    }
}

/// Process memory and CPU next to the keyspace size
pub async fn stats_handler(State(service): State<AppState>) -> impl IntoResponse {
    let shard_stats = match service.shard_set().shard_stats().await {
        Ok(stats) => stats,
        Err(e) => return unavailable(e).into_response(),
    };

    let mut sys = System::new_all();
    sys.refresh_all();

    let total_mem_bytes = sys.total_memory();
    let available_mem_bytes = sys.available_memory();
    let used_mem_bytes = total_mem_bytes.saturating_sub(available_mem_bytes);
    let db_memory_bytes: usize = shard_stats.iter().map(|s| s.memory_bytes).sum();

    let stats = SystemStats {
        total_memory_mb: to_mb(total_mem_bytes),
        used_memory_mb: to_mb(used_mem_bytes),
        free_memory_mb: to_mb(available_mem_bytes),
        cpu_usage: sys.global_cpu_usage() as f64,
        db_memory_mb: to_mb(db_memory_bytes as u64),
        keys: shard_stats.iter().map(|s| s.keys).sum(),
        shards: shard_stats.len(),
    };

    (StatusCode::OK, Json(stats)).into_response()
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// Per-shard statistics
pub async fn shard_stats_handler(State(service): State<AppState>) -> impl IntoResponse {
    match service.shard_set().shard_stats().await {
        Ok(stats) => (StatusCode::OK, Json::<Vec<ShardStats>>(stats)).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}

/// Whether anything is locked or queued right now
pub async fn locks_handler(State(service): State<AppState>) -> impl IntoResponse {
    match lock_report(&service).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}

pub(crate) async fn lock_report(service: &Service) -> Result<LockReport, crate::error::TxError> {
    let stats = service.shard_set().shard_stats().await?;
    Ok(LockReport {
        any_locked: service.is_shard_set_locked().await?,
        txq_lengths: stats.iter().map(|s| s.txq_len).collect(),
        lock_entries: stats.iter().map(|s| s.lock_entries).collect(),
    })
}
