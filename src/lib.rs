#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

//! Transparent PostgreSQL proxy that decodes the wire protocol as it passes.
//!
//! Every byte is relayed between client and server unchanged. A copy of each
//! read goes to a per-connection [`Framer`], which reassembles protocol
//! messages across arbitrary TCP chunk boundaries and hands them to a
//! [`MessageConsumer`].
//!
//! ```no_run
//! use pgspy::{Proxy, ProxyConfig, QueryWatcher};
//!
//! # async fn run() -> pgspy::Result<()> {
//! let proxy = Proxy::bind(ProxyConfig::new("127.0.0.1:5543", "127.0.0.1:5432")).await?;
//! proxy.serve(QueryWatcher::new).await
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod protocol;
pub mod proxy;

pub use config::{FramingErrorPolicy, ProxyConfig};
pub use consumer::{
    FnConsumer, MessageConsumer, QueryOutcome, QueryReport, QueryWatcher, consumer_fn,
};
pub use error::{PgSpyError, Result};
pub use protocol::{Direction, Framer, FramingError, MessageKind, ProtocolMessage, RawChunk};
pub use proxy::{ConnectionId, ConnectionPipe, PipeStats, Proxy};
