use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::sync::mpsc;

use super::ConnectionId;
use super::pipe::ConnectionPipe;
use crate::config::ProxyConfig;
use crate::consumer::{MessageConsumer, drain};
use crate::error::{PgSpyError, Result};

// Pause after a failed accept so fd exhaustion doesn't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Resolve a `host:port` string to the first address it yields.
pub async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    let mut addrs = lookup_host(addr)
        .await
        .map_err(|e| PgSpyError::Config(format!("cannot resolve {addr}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| PgSpyError::Config(format!("{addr} resolved to no addresses")))
}

/// Accept loop: one [`ConnectionPipe`] and one consumer per client.
pub struct Proxy {
    listener: TcpListener,
    upstream: SocketAddr,
    cfg: Arc<ProxyConfig>,
    next_conn_id: u64,
}

impl Proxy {
    /// Resolve both addresses and bind the listen socket.
    pub async fn bind(cfg: ProxyConfig) -> Result<Self> {
        cfg.validate()?;
        let upstream = resolve_addr(&cfg.upstream_addr).await?;
        let listen = resolve_addr(&cfg.listen_addr).await?;
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| PgSpyError::Io(format!("cannot listen on {listen}: {e}")))?;

        tracing::info!(
            listen = %listener.local_addr()?,
            upstream = %upstream,
            "proxy listening"
        );

        Ok(Self {
            listener,
            upstream,
            cfg: Arc::new(cfg),
            next_conn_id: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream
    }

    /// Accept connections forever, building a consumer for each one.
    ///
    /// Failures on a single connection are logged and never stop the loop.
    pub async fn serve<F, C>(mut self, mut make_consumer: F) -> Result<()>
    where
        F: FnMut(ConnectionId) -> C,
        C: MessageConsumer,
    {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            self.next_conn_id += 1;
            let conn_id = ConnectionId(self.next_conn_id);
            tracing::info!(%conn_id, %peer, "new connection");

            self.dispatch(conn_id, stream, make_consumer(conn_id));
        }
    }

    fn dispatch<C: MessageConsumer>(&self, conn_id: ConnectionId, stream: TcpStream, consumer: C) {
        let (msg_tx, msg_rx) = mpsc::channel(self.cfg.message_buffer);
        tokio::spawn(drain(msg_rx, consumer));

        let pipe = ConnectionPipe::new(conn_id, stream, self.upstream, Arc::clone(&self.cfg));
        tokio::spawn(async move {
            if let Err(e) = pipe.run(msg_tx).await {
                tracing::warn!(%conn_id, error = %e, "connection terminated with error");
            }
        });
    }
}
