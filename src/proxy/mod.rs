//! The proxy: listener, per-connection pipes, and the decoding task.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────── ConnectionPipe ────────────────┐
//!  client ──bytes──► │ request leg ───────────────write_all──────────►│──► PostgreSQL
//!                    │      │ RawChunk (seq from shared AtomicU64)    │
//!                    │      ▼                                         │
//!                    │  bounded mpsc ──► DecoderTask (Framer)         │
//!                    │      ▲                  │ ProtocolMessage      │
//!                    │      │ RawChunk         ▼                      │
//!  client ◄─bytes─── │ response leg ◄─────── mpsc ──► MessageConsumer │◄── PostgreSQL
//!                    └────────────────────────────────────────────────┘
//! ```
//!
//! Bytes are written to the peer unchanged whatever the decoder makes of
//! them; the decoder only ever sees copies.

mod decoder;
mod listener;
mod pipe;

use std::fmt;

pub use decoder::{DecodeStats, DecoderTask, MessageReceiver};
pub use listener::{Proxy, resolve_addr};
pub use pipe::{ConnectionPipe, LegStats, PipeStats};

/// Identifier the listener assigns to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:03}", self.0)
    }
}
