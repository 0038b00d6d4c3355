use hopdb::server::{self, Protocol};
use hopdb::{web, ServerConfig, Service, ShardSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load()?;

    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("hopdb {} starting...", env!("CARGO_PKG_VERSION"));

    let shard_config = config.shard_set();
    info!(
        "Detected {} CPU cores, creating {} shards",
        num_cpus::get(),
        shard_config.num_shards
    );
    let shards = Arc::new(ShardSet::new(&shard_config)?);
    let service = Arc::new(Service::new(shards));

    let mut servers = JoinSet::new();
    {
        let service = service.clone();
        let addr = config.resp_addr();
        servers.spawn(async move { server::listen(&addr, Protocol::Resp, service).await });
    }
    if let Some(addr) = config.memcache_addr() {
        let service = service.clone();
        servers.spawn(async move { server::listen(&addr, Protocol::Memcache, service).await });
    }
    if let Some(addr) = config.http_addr() {
        let service = service.clone();
        servers.spawn(async move { web::run_web_server(&addr, service).await });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        Some(result) = servers.join_next() => match result {
            Ok(Ok(())) => info!("Server stopped"),
            Ok(Err(e)) => error!("Server error: {}", e),
            Err(e) => error!("Server task failed: {}", e),
        },
    }

    // Listeners go first; the shard threads exit once the last service
    // reference drops the shard set.
    servers.abort_all();
    while servers.join_next().await.is_some() {}
    drop(service);
    Ok(())
}
