//! Server module
//!
//! Accepts TCP connections for the RESP and memcached listeners and hands
//! each one to its own task. All connections share one `Service`.

mod connection;

use crate::dispatch::Service;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub use connection::Connection;

/// Wire protocol spoken on a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Resp,
    Memcache,
}

/// Bind `addr` and serve `protocol` until the task is cancelled
pub async fn listen(addr: &str, protocol: Protocol, service: Arc<Service>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("hopdb {:?} server listening on {}", protocol, addr);
    serve(listener, protocol, service).await
}

/// Accept connections from an already bound listener
pub async fn serve(
    listener: TcpListener,
    protocol: Protocol,
    service: Arc<Service>,
) -> anyhow::Result<()> {
    loop {
        let (socket, addr) = listener.accept().await?;
        info!("New {:?} connection from {}", protocol, addr);
        socket.set_nodelay(true)?;

        let service = service.clone();
        tokio::spawn(async move {
            let mut connection = Connection::new(socket);
            let result = match protocol {
                Protocol::Resp => connection.serve_resp(&service).await,
                Protocol::Memcache => connection.serve_memcache(&service).await,
            };
            if let Err(e) = result {
                error!("Connection error from {}: {}", addr, e);
            }
            info!("Connection closed: {}", addr);
        });
    }
}
