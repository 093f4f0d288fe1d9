//! Error types for pgspy.
//!
//! All errors in this crate are represented by [`PgSpyError`], which covers:
//! - I/O errors (accept, upstream dial, socket read/write)
//! - Framing errors (unknown tag bytes, impossible length fields)
//! - Configuration errors (bad values, unresolvable addresses)
//! - Task errors (forwarding or decoding task panicked or was cancelled)
//!
//! Framing errors keep their typed form, [`FramingError`], so callers can
//! tell which direction desynchronised and why.

use thiserror::Error;

use crate::protocol::framing::FramingError;

/// Error type for all pgspy operations.
#[derive(Debug, Error, Clone)]
pub enum PgSpyError {
    /// I/O error on a client or upstream socket.
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// The wire stream could not be framed; decoding for the connection stops.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Invalid configuration or an address that does not resolve.
    #[error("config error: {0}")]
    Config(String),

    /// Task error - a forwarding or decoding task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(String),
}

impl PgSpyError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, PgSpyError::Io(_))
    }

    /// Returns `true` if this is a framing error.
    #[inline]
    pub fn is_framing(&self) -> bool {
        matches!(self, PgSpyError::Framing(_))
    }

    /// Returns `true` if this is a configuration error.
    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self, PgSpyError::Config(_))
    }
}

// Manual From impl since io::Error isn't Clone
impl From<std::io::Error> for PgSpyError {
    fn from(err: std::io::Error) -> Self {
        PgSpyError::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PgSpyError {
    fn from(err: tokio::task::JoinError) -> Self {
        PgSpyError::Task(err.to_string())
    }
}

/// Result type alias for pgspy operations.
pub type Result<T> = std::result::Result<T, PgSpyError>;
