//! PostgreSQL wire protocol implementation.
//!
//! This module provides the passive, observe-only side of the protocol:
//! - Classifying tag bytes per direction ([`tags`])
//! - Reassembling complete frames from arbitrarily split reads ([`framing`])
//! - Pulling report strings out of a few payloads, and building frames ([`messages`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: Startup, SSL, GSSENC and cancel request messages omit the type
//! tag, and the server answers an SSL/GSSENC request with a single byte.

pub mod framing;
pub mod messages;
pub mod tags;

pub use framing::{FrameDecoder, Framer, FramingError, ProtocolMessage, RawChunk};
pub use tags::{Direction, MessageKind, classify};
