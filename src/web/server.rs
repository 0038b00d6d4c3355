//! HTTP server implementation

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::handlers::{
    execute_command, locks_handler, shard_stats_handler, stats_handler,
};
use crate::dispatch::Service;

/// Routes of the diagnostics interface
pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/command", post(execute_command))
        .route("/stats", get(stats_handler))
        .route("/shards", get(shard_stats_handler))
        .route("/locks", get(locks_handler))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Run the web server
pub async fn run_web_server(addr: &str, service: Arc<Service>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Diagnostics available at http://{}", addr);

    axum::serve(listener, router(service)).await?;

    Ok(())
}
