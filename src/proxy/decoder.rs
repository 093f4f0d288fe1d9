use tokio::sync::mpsc;

use super::ConnectionId;
use crate::error::Result;
use crate::protocol::framing::{Framer, ProtocolMessage, RawChunk};

/// Receiving end of a connection's decoded message stream.
pub type MessageReceiver = mpsc::Receiver<ProtocolMessage>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    pub chunks: u64,
    pub messages: u64,
}

/// Single consumer of a connection's captured chunks.
///
/// Both forwarding legs feed the same bounded channel; this task owns the
/// [`Framer`], so decode state is never shared across threads.
pub struct DecoderTask {
    conn_id: ConnectionId,
    framer: Framer,
    chunks: mpsc::Receiver<RawChunk>,
    out: mpsc::Sender<ProtocolMessage>,
}

impl DecoderTask {
    pub fn new(
        conn_id: ConnectionId,
        framer: Framer,
        chunks: mpsc::Receiver<RawChunk>,
        out: mpsc::Sender<ProtocolMessage>,
    ) -> Self {
        Self {
            conn_id,
            framer,
            chunks,
            out,
        }
    }

    /// Frame chunks until both legs hang up, the consumer goes away, or the
    /// stream cannot be framed.
    pub async fn run(mut self) -> Result<DecodeStats> {
        let conn_id = self.conn_id;
        let mut stats = DecodeStats::default();
        let mut batch = Vec::new();

        while let Some(chunk) = self.chunks.recv().await {
            stats.chunks += 1;
            tracing::trace!(
                %conn_id,
                direction = %chunk.direction,
                sequence = chunk.sequence,
                len = chunk.data.len(),
                "chunk captured"
            );

            let res = self.framer.submit_into(&chunk, &mut batch);

            for msg in batch.drain(..) {
                stats.messages += 1;
                tracing::debug!(
                    %conn_id,
                    sequence = msg.sequence,
                    len = msg.payload.len(),
                    "{} {}",
                    msg.direction.arrow(),
                    msg.kind
                );
                if self.out.send(msg).await.is_err() {
                    tracing::debug!(%conn_id, "message consumer gone, decoding stops");
                    return Ok(stats);
                }
            }

            if let Err(err) = res {
                tracing::error!(
                    %conn_id,
                    sequence = chunk.sequence,
                    error = %err,
                    "framing failed"
                );
                return Err(err.into());
            }
        }

        Ok(stats)
    }
}
