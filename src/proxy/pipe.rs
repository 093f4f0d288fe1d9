use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ConnectionId;
use super::decoder::{DecodeStats, DecoderTask};
use crate::config::{FramingErrorPolicy, ProxyConfig};
use crate::error::{PgSpyError, Result};
use crate::protocol::framing::{Framer, ProtocolMessage, RawChunk};
use crate::protocol::tags::Direction;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LegStats {
    pub bytes: u64,
    pub chunks: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    pub request: LegStats,
    pub response: LegStats,
}

#[derive(Debug, Default)]
struct LegCounters {
    bytes: AtomicU64,
    chunks: AtomicU64,
}

impl LegCounters {
    fn record(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LegStats {
        LegStats {
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
        }
    }
}

/// One forwarding direction of a pipe.
struct Leg {
    conn_id: ConnectionId,
    direction: Direction,
    sequence: Arc<AtomicU64>,
    chunks: mpsc::Sender<RawChunk>,
    read_buffer_size: usize,
    counters: Arc<LegCounters>,
}

/// Copy `src` to `dst` unchanged, handing each read to the decoder first.
///
/// Returns `Ok` when `src` reaches EOF.
async fn forward<R, W>(leg: Leg, mut src: R, mut dst: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let conn_id = leg.conn_id;
    let direction = leg.direction;
    let mut buf = BytesMut::with_capacity(leg.read_buffer_size);
    let mut observing = true;

    loop {
        buf.reserve(leg.read_buffer_size);
        let n = (&mut src)
            .take(leg.read_buffer_size as u64)
            .read_buf(&mut buf)
            .await
            .map_err(|e| PgSpyError::Io(format!("{direction} read: {e}")))?;
        if n == 0 {
            tracing::debug!(%conn_id, %direction, "peer closed");
            return Ok(());
        }

        let data = buf.split().freeze();
        let sequence = leg.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        leg.counters.record(n);

        if observing {
            let chunk = RawChunk {
                direction,
                sequence,
                captured_at: Instant::now(),
                data: data.clone(),
            };
            if leg.chunks.send(chunk).await.is_err() {
                tracing::debug!(
                    %conn_id,
                    %direction,
                    "decoder stopped, forwarding without decoding"
                );
                observing = false;
            }
        }

        dst.write_all(&data)
            .await
            .map_err(|e| PgSpyError::Io(format!("{direction} write: {e}")))?;
    }
}

fn flatten<T>(res: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match res {
        Ok(inner) => inner,
        Err(join) => Err(join.into()),
    }
}

enum Ended {
    Leg(Direction, Result<()>),
    Framing(PgSpyError),
}

/// Owns one client connection and its upstream counterpart.
pub struct ConnectionPipe {
    id: ConnectionId,
    client: TcpStream,
    upstream: SocketAddr,
    cfg: Arc<ProxyConfig>,
    sequence: Arc<AtomicU64>,
}

impl ConnectionPipe {
    pub fn new(
        id: ConnectionId,
        client: TcpStream,
        upstream: SocketAddr,
        cfg: Arc<ProxyConfig>,
    ) -> Self {
        Self {
            id,
            client,
            upstream,
            cfg,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Dial upstream and proxy until either side hangs up or fails.
    ///
    /// Decoded messages go to `messages` in completion order. Both sockets
    /// are closed when this returns.
    pub async fn run(self, messages: mpsc::Sender<ProtocolMessage>) -> Result<PipeStats> {
        let conn_id = self.id;
        let server = TcpStream::connect(self.upstream)
            .await
            .map_err(|e| PgSpyError::Io(format!("connect to upstream {}: {e}", self.upstream)))?;
        server.set_nodelay(true)?;
        self.client.set_nodelay(true)?;
        tracing::debug!(%conn_id, upstream = %self.upstream, "upstream connected");

        let (chunk_tx, chunk_rx) = mpsc::channel(self.cfg.chunk_buffer);
        let framer = Framer::new(self.cfg.max_message_len);
        let mut decoder: JoinHandle<Result<DecodeStats>> =
            tokio::spawn(DecoderTask::new(conn_id, framer, chunk_rx, messages).run());

        let (client_rd, client_wr) = self.client.into_split();
        let (server_rd, server_wr) = server.into_split();
        let request_counters = Arc::new(LegCounters::default());
        let response_counters = Arc::new(LegCounters::default());

        let mut request_leg = tokio::spawn(forward(
            Leg {
                conn_id,
                direction: Direction::Request,
                sequence: Arc::clone(&self.sequence),
                chunks: chunk_tx.clone(),
                read_buffer_size: self.cfg.read_buffer_size,
                counters: Arc::clone(&request_counters),
            },
            client_rd,
            server_wr,
        ));
        let mut response_leg = tokio::spawn(forward(
            Leg {
                conn_id,
                direction: Direction::Response,
                sequence: Arc::clone(&self.sequence),
                chunks: chunk_tx,
                read_buffer_size: self.cfg.read_buffer_size,
                counters: Arc::clone(&response_counters),
            },
            server_rd,
            client_wr,
        ));

        let mut decoder_done = false;
        let ended = loop {
            tokio::select! {
                res = &mut request_leg => break Ended::Leg(Direction::Request, flatten(res)),
                res = &mut response_leg => break Ended::Leg(Direction::Response, flatten(res)),
                res = &mut decoder, if !decoder_done => {
                    decoder_done = true;
                    match flatten(res) {
                        Ok(_) => {}
                        Err(err) if self.cfg.on_framing_error == FramingErrorPolicy::Teardown => {
                            break Ended::Framing(err);
                        }
                        Err(err) => {
                            tracing::warn!(
                                %conn_id,
                                error = %err,
                                "decoding stopped, still proxying"
                            );
                        }
                    }
                }
            }
        };

        // Dropping a leg drops its socket halves; both must go for the fd to close.
        if !matches!(ended, Ended::Leg(Direction::Request, _)) {
            request_leg.abort();
            let _ = request_leg.await;
        }
        if !matches!(ended, Ended::Leg(Direction::Response, _)) {
            response_leg.abort();
            let _ = response_leg.await;
        }
        if !decoder_done {
            match flatten(decoder.await) {
                Ok(decoded) => tracing::debug!(
                    %conn_id,
                    chunks = decoded.chunks,
                    messages = decoded.messages,
                    "decoder drained"
                ),
                Err(err) => tracing::warn!(%conn_id, error = %err, "decoding stopped"),
            }
        }

        let stats = PipeStats {
            request: request_counters.snapshot(),
            response: response_counters.snapshot(),
        };
        tracing::info!(
            %conn_id,
            request_bytes = stats.request.bytes,
            response_bytes = stats.response.bytes,
            chunks = self.sequence.load(Ordering::SeqCst),
            "connection closed"
        );

        match ended {
            Ended::Leg(_, Ok(())) => Ok(stats),
            Ended::Leg(_, Err(err)) | Ended::Framing(err) => Err(err),
        }
    }
}
