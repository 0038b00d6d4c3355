//! Connection handling
//!
//! Reads requests off any byte stream, decodes them with the protocol codec,
//! runs them through the service and writes the replies back. Requests
//! pipelined in one read are answered with a single write.

use crate::dispatch::{ConnectionContext, Service};
use crate::protocol::{McReply, MemcacheCodec, RespCodec, RespValue};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// How much of a malformed request ends up in the log
const LOGGED_PREFIX: usize = 64;

/// Connection handler
pub struct Connection<S> {
    stream: S,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    context: ConnectionContext,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Connection {
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            write_buffer: BytesMut::with_capacity(4096),
            context: ConnectionContext::new(),
        }
    }

    /// Serve RESP requests until the peer disconnects
    pub async fn serve_resp(&mut self, service: &Service) -> anyhow::Result<()> {
        let mut codec = RespCodec;
        while self.read_more().await? {
            loop {
                let request = match codec.decode(&mut self.read_buffer) {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        let head = &self.read_buffer[..self.read_buffer.len().min(LOGGED_PREFIX)];
                        warn!("Protocol error: {} (request: {})", e, STANDARD.encode(head));
                        codec.encode(
                            RespValue::error(format!("ERR Protocol error: {}", e)),
                            &mut self.write_buffer,
                        )?;
                        self.flush().await?;
                        return Ok(());
                    }
                };

                let reply = match request.into_command_parts() {
                    Some(parts) => service.dispatch(&mut self.context, parts).await,
                    None => RespValue::error("ERR Protocol error: expected an array of bulk strings"),
                };
                debug!("Reply: {}", reply);
                codec.encode(reply, &mut self.write_buffer)?;
            }
            self.flush().await?;
        }
        Ok(())
    }

    /// Serve memcached requests until the peer disconnects or sends `quit`
    pub async fn serve_memcache(&mut self, service: &Service) -> anyhow::Result<()> {
        let mut codec = MemcacheCodec;
        while self.read_more().await? {
            while let Some(request) = codec.decode(&mut self.read_buffer)? {
                let cmd = match request {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!("Malformed memcached request: {}", e);
                        codec.encode(McReply::from(e), &mut self.write_buffer)?;
                        continue;
                    }
                };

                let noreply = cmd.noreply();
                match service.dispatch_memcache(&mut self.context, cmd).await {
                    Some(reply) if !noreply => codec.encode(reply, &mut self.write_buffer)?,
                    Some(_) => {}
                    None => {
                        self.flush().await?;
                        return Ok(());
                    }
                }
            }
            self.flush().await?;
        }
        Ok(())
    }

    /// Read more bytes; false once the peer closed the stream
    async fn read_more(&mut self) -> anyhow::Result<bool> {
        let n = self.stream.read_buf(&mut self.read_buffer).await?;
        if n == 0 {
            if !self.read_buffer.is_empty() {
                anyhow::bail!("connection reset by peer");
            }
            return Ok(false);
        }
        debug!("Read {} bytes", n);
        Ok(true)
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        self.write_buffer.clear();
        Ok(())
    }
}
