use crate::error::{PgSpyError, Result};

/// Largest payload PostgreSQL itself accepts in a single message (`PQ_LARGE_MESSAGE_LIMIT`).
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 0x3fff_ffff;

/// What a connection does once its wire stream can no longer be framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingErrorPolicy {
    /// Close both sockets. A desynchronised stream never recovers.
    #[default]
    Teardown,
    /// Keep forwarding raw bytes, stop decoding them.
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local `host:port` clients connect to.
    pub listen_addr: String,
    /// `host:port` of the PostgreSQL server being observed.
    pub upstream_addr: String,

    /// Upper bound on a single socket read, i.e. on one captured chunk.
    pub read_buffer_size: usize,

    /// Bounded buffer size (#chunks) between the forwarding legs and the decoder.
    pub chunk_buffer: usize,

    /// Bounded buffer size (#messages) between the decoder and the consumer.
    pub message_buffer: usize,

    /// Largest payload a length field may declare before the stream is
    /// considered corrupt.
    pub max_message_len: usize,

    pub on_framing_error: FramingErrorPolicy,
}

impl ProxyConfig {
    pub fn new(listen_addr: impl Into<String>, upstream_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            upstream_addr: upstream_addr.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(PgSpyError::Config("listen address is empty".into()));
        }
        if self.upstream_addr.is_empty() {
            return Err(PgSpyError::Config("upstream address is empty".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(PgSpyError::Config("read_buffer_size must be > 0".into()));
        }
        if self.chunk_buffer == 0 || self.message_buffer == 0 {
            return Err(PgSpyError::Config(
                "chunk_buffer and message_buffer must be > 0".into(),
            ));
        }
        if self.max_message_len == 0 {
            return Err(PgSpyError::Config("max_message_len must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5543".into(),
            upstream_addr: "127.0.0.1:5432".into(),
            read_buffer_size: 64 * 1024,
            chunk_buffer: 1024,
            message_buffer: 8192,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            on_framing_error: FramingErrorPolicy::Teardown,
        }
    }
}
