//! Stateful reassembly of PostgreSQL frames from captured socket reads.
//!
//! TCP preserves no message boundaries: one read may hold half a length
//! field, or ten complete messages and the start of an eleventh. Each
//! direction of a connection therefore owns a [`FrameDecoder`] that carries
//! the partially assembled message (and partial header) from one
//! [`RawChunk`] to the next. The [`Framer`] pairs the two decoders of one
//! connection; they never share state.
//!
//! ```text
//! StartupMessage:  int32 len | body (len - 4 bytes)            (request, first frame)
//! Ordinary:        u8 tag | int32 len | payload (len - 4 bytes)
//! ```
//!
//! A framing error poisons the direction it happened on. There is no attempt
//! to resynchronise: without a marker in the byte stream, any guess would
//! report garbage as messages.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::tags::{Direction, MessageKind, classify};
use crate::config::DEFAULT_MAX_MESSAGE_LEN;

/// `SSLRequest` code sent in place of a protocol version.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
/// `GSSENCRequest` code sent in place of a protocol version.
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;
/// `CancelRequest` code sent in place of a protocol version.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;
/// The server rejects startup packets longer than this (`MAX_STARTUP_PACKET_LENGTH`).
pub const MAX_STARTUP_LEN: u32 = 10_000;

// length + protocol version
const MIN_STARTUP_LEN: u32 = 8;
const LENGTH_FIELD_LEN: usize = 4;
const TAGGED_HEADER_LEN: usize = 5;
// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// Bytes captured from one read on one leg of a connection.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub direction: Direction,
    /// Per-connection capture order, shared by both directions.
    pub sequence: u64,
    pub captured_at: Instant,
    pub data: Bytes,
}

impl RawChunk {
    pub fn new(direction: Direction, sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            direction,
            sequence,
            captured_at: Instant::now(),
            data: data.into(),
        }
    }
}

/// One complete frame.
#[derive(Debug, Clone)]
pub struct ProtocolMessage {
    pub kind: MessageKind,
    /// Wire tag; `None` for the tagless startup frames.
    pub tag: Option<u8>,
    /// Message body, excluding tag and length field.
    pub payload: Bytes,
    pub direction: Direction,
    /// Sequence number of the chunk that completed this message.
    pub sequence: u64,
    /// Capture time of the chunk that completed this message.
    pub captured_at: Instant,
}

impl ProtocolMessage {
    /// Number of bytes the frame occupied on the wire.
    pub fn wire_len(&self) -> usize {
        match (self.kind, self.tag) {
            (MessageKind::EncryptionResponse, _) => 1,
            (_, Some(_)) => TAGGED_HEADER_LEN + self.payload.len(),
            (_, None) => LENGTH_FIELD_LEN + self.payload.len(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("unknown {direction} tag 0x{tag:02x}")]
    UnknownTag { direction: Direction, tag: u8 },

    #[error("invalid {direction} {kind} length {len}")]
    InvalidLength {
        direction: Direction,
        kind: MessageKind,
        len: u32,
    },

    #[error("{direction} {kind} declares length {len}, limit is {limit}")]
    TooLarge {
        direction: Direction,
        kind: MessageKind,
        len: u32,
        limit: usize,
    },
}

impl FramingError {
    pub fn direction(&self) -> Direction {
        match self {
            FramingError::UnknownTag { direction, .. }
            | FramingError::InvalidLength { direction, .. }
            | FramingError::TooLarge { direction, .. } => *direction,
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    /// Next frame is tagless (start of the request stream, or after an
    /// encryption request was answered).
    Startup,
    /// The client asked for encryption: the next response byte is a lone
    /// `S`/`G`/`N`, or an ordinary message from a server that errors out.
    Negotiation,
    Messages,
    /// Encrypted session: bytes are forwarded but cannot be framed.
    Opaque,
    Failed(FramingError),
}

#[derive(Debug)]
struct InFlight {
    kind: MessageKind,
    tag: Option<u8>,
    payload: BytesMut,
    remaining: usize,
}

/// Decode state for one direction of one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    direction: Direction,
    max_message_len: usize,
    phase: Phase,
    header: [u8; TAGGED_HEADER_LEN],
    header_filled: usize,
    in_flight: Option<InFlight>,
}

impl FrameDecoder {
    pub fn new(direction: Direction, max_message_len: usize) -> Self {
        let phase = match direction {
            Direction::Request => Phase::Startup,
            Direction::Response => Phase::Messages,
        };
        Self {
            direction,
            max_message_len,
            phase,
            header: [0; TAGGED_HEADER_LEN],
            header_filled: 0,
            in_flight: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True when no partial header or payload is buffered.
    pub fn is_idle(&self) -> bool {
        self.header_filled == 0 && self.in_flight.is_none()
    }

    /// True once the session switched to TLS/GSS encryption.
    pub fn is_opaque(&self) -> bool {
        matches!(self.phase, Phase::Opaque)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.phase, Phase::Failed(_))
    }

    fn is_negotiating(&self) -> bool {
        matches!(self.phase, Phase::Negotiation)
    }

    /// Expect a single-byte encryption reply before the next message.
    fn await_encryption_reply(&mut self) {
        if matches!(self.phase, Phase::Messages) && self.is_idle() {
            self.phase = Phase::Negotiation;
        }
    }

    /// The peer switched to TLS or GSS encryption.
    fn set_opaque(&mut self) {
        if !self.is_failed() {
            self.header_filled = 0;
            self.in_flight = None;
            self.phase = Phase::Opaque;
        }
    }

    /// Bytes still needed to finish the message in flight, if any.
    pub fn remaining(&self) -> Option<usize> {
        self.in_flight.as_ref().map(|m| m.remaining)
    }

    /// Feed one chunk; completed messages are appended to `out` in wire order.
    ///
    /// On error, messages completed earlier in the same chunk are still in
    /// `out`, and every later call returns the same error.
    pub fn decode(
        &mut self,
        chunk: &RawChunk,
        out: &mut Vec<ProtocolMessage>,
    ) -> Result<(), FramingError> {
        let data = &chunk.data;
        let mut pos = 0;

        while pos < data.len() {
            match &self.phase {
                Phase::Failed(err) => return Err(err.clone()),
                Phase::Opaque => return Ok(()),
                _ => {}
            }

            if self.in_flight.is_some() {
                pos += self.fill_payload(chunk, pos, out);
                continue;
            }

            if self.header_filled == 0 && self.take_tagless(chunk, pos, out) {
                pos += 1;
                continue;
            }

            let want = self.header_len() - self.header_filled;
            let take = want.min(data.len() - pos);
            self.header[self.header_filled..self.header_filled + take]
                .copy_from_slice(&data[pos..pos + take]);
            self.header_filled += take;
            pos += take;

            if self.header_filled < self.header_len() {
                break;
            }
            self.header_filled = 0;

            if let Err(err) = self.begin_message(chunk, out) {
                self.phase = Phase::Failed(err.clone());
                return Err(err);
            }
        }

        // A chunk that ends exactly on a boundary still reports a poisoned state.
        if let Phase::Failed(err) = &self.phase {
            return Err(err.clone());
        }
        Ok(())
    }

    fn header_len(&self) -> usize {
        match self.phase {
            Phase::Startup => LENGTH_FIELD_LEN,
            _ => TAGGED_HEADER_LEN,
        }
    }

    /// Handles the single bytes that are not length-prefixed frames. Returns
    /// true when the byte at `pos` was consumed.
    fn take_tagless(
        &mut self,
        chunk: &RawChunk,
        pos: usize,
        out: &mut Vec<ProtocolMessage>,
    ) -> bool {
        let byte = chunk.data[pos];
        match self.phase {
            Phase::Startup if byte == TLS_HANDSHAKE => {
                tracing::debug!(direction = %self.direction, "tls handshake seen, decoding stops");
                self.phase = Phase::Opaque;
                true
            }
            Phase::Negotiation => match byte {
                b'S' | b'G' | b'N' => {
                    let kind = MessageKind::EncryptionResponse;
                    self.emit(kind, Some(byte), Bytes::new(), chunk, out);
                    self.phase = if byte == b'N' {
                        Phase::Messages
                    } else {
                        Phase::Opaque
                    };
                    true
                }
                _ => {
                    self.phase = Phase::Messages;
                    false
                }
            },
            _ => false,
        }
    }

    fn begin_message(
        &mut self,
        chunk: &RawChunk,
        out: &mut Vec<ProtocolMessage>,
    ) -> Result<(), FramingError> {
        let direction = self.direction;

        let (kind, tag, len) = if let Phase::Startup = self.phase {
            let len = read_len(&self.header[..4]);
            let kind = MessageKind::StartupMessage;
            if len < MIN_STARTUP_LEN {
                return Err(FramingError::InvalidLength { direction, kind, len });
            }
            if len > MAX_STARTUP_LEN {
                return Err(FramingError::TooLarge {
                    direction,
                    kind,
                    len,
                    limit: MAX_STARTUP_LEN as usize,
                });
            }
            (kind, None, len)
        } else {
            let tag = self.header[0];
            let kind = classify(direction, tag);
            if !kind.is_recognized() {
                return Err(FramingError::UnknownTag { direction, tag });
            }
            let len = read_len(&self.header[1..]);
            if len == 0 {
                // No room for a payload: complete after tag + length.
                self.emit(kind, Some(tag), Bytes::new(), chunk, out);
                return Ok(());
            }
            if (len as usize) < LENGTH_FIELD_LEN {
                return Err(FramingError::InvalidLength { direction, kind, len });
            }
            (kind, Some(tag), len)
        };

        let payload_len = len as usize - LENGTH_FIELD_LEN;
        if payload_len > self.max_message_len {
            return Err(FramingError::TooLarge {
                direction,
                kind,
                len,
                limit: self.max_message_len,
            });
        }

        if payload_len == 0 {
            self.emit(kind, tag, Bytes::new(), chunk, out);
        } else {
            self.in_flight = Some(InFlight {
                kind,
                tag,
                payload: BytesMut::new(),
                remaining: payload_len,
            });
        }
        Ok(())
    }

    /// Moves payload bytes from `chunk[pos..]` into the message in flight and
    /// returns how many were used.
    fn fill_payload(
        &mut self,
        chunk: &RawChunk,
        pos: usize,
        out: &mut Vec<ProtocolMessage>,
    ) -> usize {
        let Some(mut msg) = self.in_flight.take() else {
            return 0;
        };
        let available = chunk.data.len() - pos;

        if msg.payload.is_empty() && available >= msg.remaining {
            // Whole payload inside this chunk: share the chunk's buffer.
            let used = msg.remaining;
            let payload = chunk.data.slice(pos..pos + used);
            self.emit(msg.kind, msg.tag, payload, chunk, out);
            return used;
        }

        let used = available.min(msg.remaining);
        msg.payload.extend_from_slice(&chunk.data[pos..pos + used]);
        msg.remaining -= used;

        if msg.remaining == 0 {
            self.emit(msg.kind, msg.tag, msg.payload.freeze(), chunk, out);
        } else {
            self.in_flight = Some(msg);
        }
        used
    }

    fn emit(
        &mut self,
        kind: MessageKind,
        tag: Option<u8>,
        payload: Bytes,
        chunk: &RawChunk,
        out: &mut Vec<ProtocolMessage>,
    ) {
        let kind = if kind == MessageKind::StartupMessage {
            startup_kind(&payload)
        } else {
            kind
        };
        if kind == MessageKind::StartupMessage {
            self.phase = Phase::Messages;
        }

        out.push(ProtocolMessage {
            kind,
            tag,
            payload,
            direction: self.direction,
            sequence: chunk.sequence,
            captured_at: chunk.captured_at,
        });
    }
}

fn read_len(field: &[u8]) -> u32 {
    u32::from_be_bytes([field[0], field[1], field[2], field[3]])
}

/// Startup frames are told apart by the code where the protocol version goes.
fn startup_kind(body: &[u8]) -> MessageKind {
    let Some(code) = body.get(..4) else {
        return MessageKind::StartupMessage;
    };
    match read_len(code) {
        SSL_REQUEST_CODE => MessageKind::SslRequest,
        GSSENC_REQUEST_CODE => MessageKind::GssEncRequest,
        CANCEL_REQUEST_CODE => MessageKind::CancelRequest,
        _ => MessageKind::StartupMessage,
    }
}

/// Both decode states of one connection.
///
/// The two directions only meet during encryption negotiation: an
/// `SSLRequest`/`GSSENCRequest` makes the response side expect a one-byte
/// reply, and an accepted reply makes the request side opaque. The request
/// chunk always reaches the framer before the server could have answered it.
#[derive(Debug)]
pub struct Framer {
    request: FrameDecoder,
    response: FrameDecoder,
    encryption_requested: bool,
}

impl Framer {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            request: FrameDecoder::new(Direction::Request, max_message_len),
            response: FrameDecoder::new(Direction::Response, max_message_len),
            encryption_requested: false,
        }
    }

    /// Frame one chunk and return the messages it completed.
    pub fn submit(&mut self, chunk: RawChunk) -> Result<Vec<ProtocolMessage>, FramingError> {
        let mut out = Vec::new();
        self.submit_into(&chunk, &mut out)?;
        Ok(out)
    }

    /// Like [`Framer::submit`], but keeps the messages completed before an
    /// error in `out`.
    pub fn submit_into(
        &mut self,
        chunk: &RawChunk,
        out: &mut Vec<ProtocolMessage>,
    ) -> Result<(), FramingError> {
        let start = out.len();
        match chunk.direction {
            Direction::Request => {
                let res = self.request.decode(chunk, out);
                if out[start..].iter().any(|m| {
                    matches!(m.kind, MessageKind::SslRequest | MessageKind::GssEncRequest)
                }) {
                    self.encryption_requested = true;
                }
                res
            }
            Direction::Response => {
                if self.encryption_requested {
                    self.response.await_encryption_reply();
                }
                let res = self.response.decode(chunk, out);
                let accepted = out[start..].iter().any(|m| {
                    m.kind == MessageKind::EncryptionResponse && m.tag != Some(b'N')
                });
                if accepted {
                    tracing::debug!("encryption accepted, decoding stops");
                    self.request.set_opaque();
                }
                self.encryption_requested = self.response.is_negotiating();
                res
            }
        }
    }

    pub fn decoder(&self, direction: Direction) -> &FrameDecoder {
        match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{encode_message, encode_ssl_request, encode_startup_message};

    fn req(seq: u64, data: &[u8]) -> RawChunk {
        RawChunk::new(Direction::Request, seq, data.to_vec())
    }

    fn resp(seq: u64, data: &[u8]) -> RawChunk {
        RawChunk::new(Direction::Response, seq, data.to_vec())
    }

    fn summary(msgs: &[ProtocolMessage]) -> Vec<(MessageKind, Option<u8>, Vec<u8>)> {
        msgs.iter()
            .map(|m| (m.kind, m.tag, m.payload.to_vec()))
            .collect()
    }

    /// A framer whose request side is past the startup frame.
    fn started() -> Framer {
        let mut framer = Framer::default();
        let startup = encode_startup_message(196608, &[("user", "postgres")]);
        let msgs = framer.submit(req(0, &startup)).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::StartupMessage);
        framer
    }

    fn request_stream() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&encode_startup_message(
            196608,
            &[("user", "app"), ("database", "orders")],
        ));
        v.extend_from_slice(&encode_message(b'P', b"\0SELECT $1::int\0\0\0"));
        v.extend_from_slice(&encode_message(b'B', b"\0\0\0\0\0\x01\0\0\0\x0142\0\0"));
        v.extend_from_slice(&encode_message(b'E', b"\0\0\0\0\0"));
        v.extend_from_slice(&encode_message(b'S', b""));
        v.extend_from_slice(&encode_message(b'Q', b"SELECT 1\0"));
        v.extend_from_slice(&encode_message(b'X', b""));
        v
    }

    /// Server side of a session: auth, parameters, then a small result set.
    /// With `refused_ssl` it opens with the `N` answer to an SSLRequest.
    fn response_stream(refused_ssl: bool) -> Vec<u8> {
        let mut v = Vec::new();
        if refused_ssl {
            v.push(b'N');
        }
        v.extend_from_slice(&encode_message(b'R', &0i32.to_be_bytes()));
        v.extend_from_slice(&encode_message(b'S', b"server_version\016.4\0"));
        v.extend_from_slice(&encode_message(b'S', b"client_encoding\0UTF8\0"));
        v.extend_from_slice(&encode_message(b'K', &[0, 0, 0x30, 0x39, 0xde, 0xad, 0xbe, 0xef]));
        v.extend_from_slice(&encode_message(b'Z', b"I"));
        v.extend_from_slice(&encode_message(b'1', b""));
        v.extend_from_slice(&encode_message(b'n', b""));
        v.extend_from_slice(&encode_message(
            b'T',
            b"\0\x01v\0\0\0\0\0\0\0\0\0\0\x19\xff\xff\xff\xff\xff\xff\0\0",
        ));
        for row in [&b"alpha"[..], b"b", b"a much longer value than the others"] {
            let mut payload = vec![0, 1];
            payload.extend_from_slice(&(row.len() as u32).to_be_bytes());
            payload.extend_from_slice(row);
            v.extend_from_slice(&encode_message(b'D', &payload));
        }
        v.extend_from_slice(&encode_message(b'C', b"SELECT 3\0"));
        v.extend_from_slice(&encode_message(b'Z', b"I"));
        v
    }

    /// A framer that has seen an SSLRequest on the request side.
    fn after_ssl_request() -> Framer {
        let mut framer = Framer::default();
        let msgs = framer.submit(req(0, &encode_ssl_request())).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::SslRequest);
        framer
    }

    fn frame_with(
        mut framer: Framer,
        direction: Direction,
        stream: &[u8],
        sizes: impl Iterator<Item = usize>,
    ) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        let mut rest = stream;
        for (seq, size) in sizes.enumerate() {
            if rest.is_empty() {
                break;
            }
            let n = size.min(rest.len());
            let chunk = RawChunk::new(direction, seq as u64 + 1, rest[..n].to_vec());
            framer.submit_into(&chunk, &mut out).unwrap();
            rest = &rest[n..];
        }
        assert!(rest.is_empty());
        assert!(framer.decoder(direction).is_idle());
        assert!(!framer.decoder(direction).is_opaque());
        out
    }

    fn frame_in_pieces(stream: &[u8], sizes: impl Iterator<Item = usize>) -> Vec<ProtocolMessage> {
        frame_with(Framer::default(), Direction::Request, stream, sizes)
    }

    #[test]
    fn simple_query_in_one_chunk() {
        let mut framer = started();
        let chunk = [
            b'Q', 0x00, 0x00, 0x00, 0x0D, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', 0x00,
        ];
        let msgs = framer.submit(req(1, &chunk)).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::Query);
        assert_eq!(msgs[0].tag, Some(b'Q'));
        assert_eq!(&msgs[0].payload[..], b"SELECT 1\0");
        assert_eq!(msgs[0].direction, Direction::Request);
        assert_eq!(msgs[0].wire_len(), chunk.len());
    }

    #[test]
    fn ready_for_query_response() {
        let mut framer = Framer::default();
        let msgs = framer.submit(resp(1, &[b'Z', 0, 0, 0, 5, b'I'])).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::ReadyForQuery);
        assert_eq!(&msgs[0].payload[..], b"I");
    }

    #[test]
    fn several_messages_in_one_chunk() {
        let mut framer = Framer::default();
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&encode_message(
            b'T',
            b"\0\x01id\0\0\0\0\0\0\0\0\0\0\x17\0\x04\xff\xff\xff\xff\0\0",
        ));
        chunk.extend_from_slice(&encode_message(b'D', b"\0\x01\0\0\0\x011"));
        chunk.extend_from_slice(&encode_message(b'D', b"\0\x01\0\0\0\x012"));
        chunk.extend_from_slice(&encode_message(b'C', b"SELECT 2\0"));
        chunk.extend_from_slice(&encode_message(b'Z', b"I"));

        let msgs = framer.submit(resp(3, &chunk)).unwrap();
        let kinds: Vec<_> = msgs.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::RowDescription,
                MessageKind::DataRow,
                MessageKind::DataRow,
                MessageKind::CommandComplete,
                MessageKind::ReadyForQuery,
            ]
        );
        assert!(msgs.iter().all(|m| m.sequence == 3));
        assert_eq!(msgs.iter().map(ProtocolMessage::wire_len).sum::<usize>(), chunk.len());
    }

    #[test]
    fn chunk_boundary_inside_length_field() {
        let mut framer = started();
        assert!(framer.submit(req(1, &[b'Q', 0x00, 0x00])).unwrap().is_empty());
        assert!(!framer.decoder(Direction::Request).is_idle());

        let msgs = framer
            .submit(req(2, &[0x00, 0x0D, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', 0x00]))
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::Query);
        assert_eq!(&msgs[0].payload[..], b"SELECT 1\0");
        assert_eq!(msgs[0].sequence, 2);
    }

    #[test]
    fn payload_split_tracks_remaining() {
        let mut framer = started();
        let frame = encode_message(b'Q', b"SELECT now()\0");
        assert!(framer.submit(req(1, &frame[..8])).unwrap().is_empty());
        assert_eq!(framer.decoder(Direction::Request).remaining(), Some(frame.len() - 8));

        let msgs = framer.submit(req(2, &frame[8..])).unwrap();
        assert_eq!(&msgs[0].payload[..], b"SELECT now()\0");
        assert_eq!(framer.decoder(Direction::Request).remaining(), None);
    }

    #[test]
    fn startup_frame_is_exactly_its_length() {
        let mut framer = Framer::default();
        let startup = encode_startup_message(196608, &[("user", "postgres"), ("database", "app")]);
        let mut chunk = startup.to_vec();
        chunk.extend_from_slice(&encode_message(b'Q', b"SELECT 1\0"));

        let msgs = framer.submit(req(1, &chunk)).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].kind, MessageKind::StartupMessage);
        assert_eq!(msgs[0].tag, None);
        assert_eq!(msgs[0].payload.len() + 4, startup.len());
        assert_eq!(&msgs[0].payload[..4], &196608u32.to_be_bytes());
        assert_eq!(msgs[0].wire_len(), startup.len());
        assert_eq!(msgs[1].kind, MessageKind::Query);
    }

    #[test]
    fn startup_delivered_byte_by_byte() {
        let startup = encode_startup_message(196608, &[("user", "postgres")]);
        let msgs = frame_in_pieces(&startup, std::iter::repeat(1));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::StartupMessage);
        assert_eq!(msgs[0].payload.len(), startup.len() - 4);
    }

    #[test]
    fn unknown_tag_is_fatal_and_sticky() {
        let mut framer = Framer::default();
        let mut chunk = encode_message(b'Z', b"I").to_vec();
        chunk.extend_from_slice(&[b'!', 0, 0, 0, 4]);

        let mut out = Vec::new();
        let err = framer.submit_into(&resp(1, &chunk), &mut out).unwrap_err();
        assert_eq!(
            err,
            FramingError::UnknownTag {
                direction: Direction::Response,
                tag: b'!'
            }
        );
        // The message before the bad tag was still delivered.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, MessageKind::ReadyForQuery);

        let again = framer.submit(resp(2, &encode_message(b'Z', b"I"))).unwrap_err();
        assert_eq!(again, err);
        assert!(framer.decoder(Direction::Response).is_failed());
        assert!(!framer.decoder(Direction::Request).is_failed());
    }

    #[test]
    fn request_tag_unknown_on_request_side() {
        let mut framer = started();
        // 'Z' is a backend-only tag.
        let err = framer.submit(req(1, &[b'Z', 0, 0, 0, 5, b'I'])).unwrap_err();
        assert!(matches!(err, FramingError::UnknownTag { tag: b'Z', .. }));
        assert_eq!(err.direction(), Direction::Request);
        assert!(err.to_string().contains("0x5a"));
    }

    #[test]
    fn zero_length_completes_after_header() {
        let mut framer = Framer::default();
        let mut chunk = vec![b'n', 0, 0, 0, 0];
        chunk.extend_from_slice(&encode_message(b'Z', b"I"));
        let msgs = framer.submit(resp(1, &chunk)).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].kind, MessageKind::NoData);
        assert!(msgs[0].payload.is_empty());
        assert_eq!(msgs[1].kind, MessageKind::ReadyForQuery);
    }

    #[test]
    fn length_below_four_is_invalid() {
        let mut framer = Framer::default();
        let err = framer.submit(resp(1, &[b'Z', 0, 0, 0, 2])).unwrap_err();
        assert_eq!(
            err,
            FramingError::InvalidLength {
                direction: Direction::Response,
                kind: MessageKind::ReadyForQuery,
                len: 2
            }
        );
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut framer = Framer::new(1024);
        let err = framer.submit(resp(1, &[b'D', 0x7f, 0xff, 0xff, 0xff])).unwrap_err();
        assert!(matches!(
            err,
            FramingError::TooLarge {
                kind: MessageKind::DataRow,
                limit: 1024,
                ..
            }
        ));
    }

    #[test]
    fn startup_length_bounds() {
        let mut framer = Framer::default();
        let err = framer.submit(req(1, &[0, 0, 0, 4])).unwrap_err();
        assert!(matches!(err, FramingError::InvalidLength { len: 4, .. }));

        let mut framer = Framer::default();
        let err = framer.submit(req(1, &20_000u32.to_be_bytes())).unwrap_err();
        assert!(matches!(err, FramingError::TooLarge { len: 20_000, .. }));
    }

    #[test]
    fn every_two_way_split_matches_whole_stream() {
        let stream = request_stream();
        let whole = summary(&frame_in_pieces(&stream, std::iter::once(stream.len())));
        assert_eq!(whole.len(), 7);

        for cut in 1..stream.len() {
            let split = frame_in_pieces(&stream, [cut, stream.len() - cut].into_iter());
            assert_eq!(summary(&split), whole, "split at {cut}");
        }
    }

    #[test]
    fn uneven_chunk_sizes_match_whole_stream() {
        let stream = request_stream();
        let whole = summary(&frame_in_pieces(&stream, std::iter::once(stream.len())));

        for size in 1..=9 {
            let pieces = frame_in_pieces(&stream, std::iter::repeat(size));
            assert_eq!(summary(&pieces), whole, "chunk size {size}");
        }
        let cycling = frame_in_pieces(&stream, [3, 1, 7, 2, 13, 5].into_iter().cycle());
        assert_eq!(summary(&cycling), whole);
    }

    #[test]
    fn response_stream_survives_every_two_way_split() {
        for refused_ssl in [false, true] {
            let stream = response_stream(refused_ssl);
            let framer = || {
                if refused_ssl {
                    after_ssl_request()
                } else {
                    Framer::default()
                }
            };
            let whole = summary(&frame_with(
                framer(),
                Direction::Response,
                &stream,
                std::iter::once(stream.len()),
            ));
            assert_eq!(whole.len(), 13 + usize::from(refused_ssl));

            for cut in 1..stream.len() {
                let sizes = [cut, stream.len() - cut].into_iter();
                let split = frame_with(framer(), Direction::Response, &stream, sizes);
                assert_eq!(summary(&split), whole, "split at {cut}, refused_ssl={refused_ssl}");
            }
        }
    }

    #[test]
    fn response_stream_uneven_chunk_sizes_match_whole_stream() {
        for refused_ssl in [false, true] {
            let stream = response_stream(refused_ssl);
            let framer = || {
                if refused_ssl {
                    after_ssl_request()
                } else {
                    Framer::default()
                }
            };
            let whole = summary(&frame_with(
                framer(),
                Direction::Response,
                &stream,
                std::iter::once(stream.len()),
            ));
            if refused_ssl {
                assert_eq!(whole[0], (MessageKind::EncryptionResponse, Some(b'N'), vec![]));
                assert_eq!(whole[1].0, MessageKind::Authentication);
            } else {
                assert_eq!(whole[0].0, MessageKind::Authentication);
                assert_eq!(whole[1].0, MessageKind::ParameterStatus);
            }

            for size in 1..=9 {
                let pieces =
                    frame_with(framer(), Direction::Response, &stream, std::iter::repeat(size));
                assert_eq!(summary(&pieces), whole, "chunk size {size}, refused_ssl={refused_ssl}");
            }
        }
    }

    #[test]
    fn leading_s_without_ssl_request_is_parameter_status() {
        let mut framer = started();
        let mut chunk = encode_message(b'S', b"server_version\016.4\0").to_vec();
        chunk.extend_from_slice(&encode_message(b'Z', b"I"));

        let msgs = framer.submit(resp(1, &chunk)).unwrap();
        let kinds: Vec<_> = msgs.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::ParameterStatus, MessageKind::ReadyForQuery]
        );
        assert!(!framer.decoder(Direction::Response).is_opaque());
    }

    #[test]
    fn error_reply_to_ssl_request_is_an_ordinary_message() {
        let mut framer = after_ssl_request();
        let reply = encode_message(b'E', b"SFATAL\0Munsupported frontend protocol\0\0");
        let msgs = framer.submit(resp(1, &reply)).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::ErrorResponse);
        assert_eq!(msgs[0].wire_len(), reply.len());
    }

    #[test]
    fn accepted_gssenc_makes_request_side_opaque() {
        let mut gss_request = Vec::new();
        gss_request.extend_from_slice(&8u32.to_be_bytes());
        gss_request.extend_from_slice(&GSSENC_REQUEST_CODE.to_be_bytes());

        let mut framer = Framer::default();
        let msgs = framer.submit(req(1, &gss_request)).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::GssEncRequest);

        let msgs = framer.submit(resp(2, b"G")).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::EncryptionResponse);
        assert_eq!(msgs[0].tag, Some(b'G'));
        assert!(framer.decoder(Direction::Request).is_opaque());
        assert!(framer.decoder(Direction::Response).is_opaque());

        // GSS-wrapped packets: a length word then opaque token bytes.
        let wrapped = [0, 0, 0, 0x60, 0x60, 0x81, 0x12, 0x06, 0x09];
        assert!(framer.submit(req(3, &wrapped)).unwrap().is_empty());
        assert!(framer.submit(req(4, &wrapped)).unwrap().is_empty());
        assert!(!framer.decoder(Direction::Request).is_failed());
    }

    #[test]
    fn refused_ssl_then_gssenc_request_is_negotiated_again() {
        let mut framer = after_ssl_request();
        assert_eq!(framer.submit(resp(1, b"N")).unwrap()[0].kind, MessageKind::EncryptionResponse);

        let mut gss_request = Vec::new();
        gss_request.extend_from_slice(&8u32.to_be_bytes());
        gss_request.extend_from_slice(&GSSENC_REQUEST_CODE.to_be_bytes());
        framer.submit(req(2, &gss_request)).unwrap();

        let msgs = framer.submit(resp(3, b"N")).unwrap();
        assert_eq!(msgs[0].tag, Some(b'N'));

        // After the second refusal `N` is a NoticeResponse tag again.
        framer
            .submit(req(4, &encode_startup_message(196608, &[("user", "postgres")])))
            .unwrap();
        let notice = encode_message(b'N', b"SNOTICE\0Mhello\0\0");
        let msgs = framer.submit(resp(5, &notice)).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::NoticeResponse);
    }

    #[test]
    fn directions_do_not_interfere() {
        let mut framer = started();
        let query = encode_message(b'Q', b"SELECT 1\0");
        assert!(framer.submit(req(1, &query[..3])).unwrap().is_empty());

        let msgs = framer.submit(resp(2, &encode_message(b'Z', b"I"))).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::ReadyForQuery);

        let msgs = framer.submit(req(3, &query[3..])).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::Query);
        assert_eq!(msgs[0].direction, Direction::Request);
    }

    #[test]
    fn refused_ssl_request_continues_with_startup() {
        let mut framer = Framer::default();
        let msgs = framer.submit(req(1, &encode_ssl_request())).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::SslRequest);

        let mut reply = vec![b'N'];
        reply.extend_from_slice(&encode_message(b'R', &0i32.to_be_bytes()));
        let msgs = framer.submit(resp(2, &reply[..1])).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::EncryptionResponse);
        assert_eq!(msgs[0].wire_len(), 1);

        let startup = encode_startup_message(196608, &[("user", "postgres")]);
        let msgs = framer.submit(req(3, &startup)).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::StartupMessage);

        let msgs = framer.submit(resp(4, &reply[1..])).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::Authentication);
    }

    #[test]
    fn accepted_ssl_makes_both_directions_opaque() {
        let mut framer = Framer::default();
        framer.submit(req(1, &encode_ssl_request())).unwrap();
        let msgs = framer.submit(resp(2, b"S")).unwrap();
        assert_eq!(msgs[0].tag, Some(b'S'));
        assert!(framer.decoder(Direction::Response).is_opaque());

        // TLS ClientHello, then server handshake bytes: forwarded, never framed.
        assert!(framer.submit(req(3, &[0x16, 0x03, 0x01, 0x02, 0x00, 0x01])).unwrap().is_empty());
        assert!(framer.decoder(Direction::Request).is_opaque());
        assert!(framer.submit(resp(4, &[0x16, 0x03, 0x03, 0x00, 0x7a])).unwrap().is_empty());
    }

    #[test]
    fn cancel_request_is_classified() {
        let mut body = Vec::new();
        body.extend_from_slice(&16u32.to_be_bytes());
        body.extend_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        body.extend_from_slice(&1234u32.to_be_bytes());
        body.extend_from_slice(&5678u32.to_be_bytes());

        let mut framer = Framer::default();
        let msgs = framer.submit(req(1, &body)).unwrap();
        assert_eq!(msgs[0].kind, MessageKind::CancelRequest);
        assert!(msgs[0].kind.is_startup());
    }
}
