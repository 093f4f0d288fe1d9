//! Tag byte classification.
//!
//! The same byte names different messages depending on who sent it (`D` is
//! `Describe` from the client and `DataRow` from the server), so there is one
//! table per [`Direction`]. Both tables are built at compile time and indexed
//! directly by the tag byte.

use std::fmt;

/// Which leg of a connection a chunk or message travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server (frontend messages).
    Request,
    /// Server to client (backend messages).
    Response,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }

    /// Arrow used in log lines, pointing from client to server.
    pub fn arrow(self) -> &'static str {
        match self {
            Direction::Request => "->",
            Direction::Response => "<-",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every message kind pgspy can frame.
///
/// `Unrecognized` is what the tables hold for unassigned bytes; the framer
/// never emits it, it turns it into a fatal error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Tagless connection-startup frames (request direction).
    StartupMessage,
    SslRequest,
    GssEncRequest,
    CancelRequest,

    // Single-byte reply to SslRequest / GssEncRequest (response direction).
    EncryptionResponse,

    // Frontend.
    Bind,
    Close,
    CopyData,
    CopyDone,
    CopyFail,
    Describe,
    Execute,
    Flush,
    FunctionCall,
    Parse,
    PasswordMessage,
    Query,
    Sync,
    Terminate,

    // Backend. CopyData and CopyDone are shared with the frontend.
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    FunctionCallResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,

    Unrecognized,
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::StartupMessage => "StartupMessage",
            MessageKind::SslRequest => "SSLRequest",
            MessageKind::GssEncRequest => "GSSENCRequest",
            MessageKind::CancelRequest => "CancelRequest",
            MessageKind::EncryptionResponse => "EncryptionResponse",
            MessageKind::Bind => "Bind",
            MessageKind::Close => "Close",
            MessageKind::CopyData => "CopyData",
            MessageKind::CopyDone => "CopyDone",
            MessageKind::CopyFail => "CopyFail",
            MessageKind::Describe => "Describe",
            MessageKind::Execute => "Execute",
            MessageKind::Flush => "Flush",
            MessageKind::FunctionCall => "FunctionCall",
            MessageKind::Parse => "Parse",
            MessageKind::PasswordMessage => "PasswordMessage",
            MessageKind::Query => "Query",
            MessageKind::Sync => "Sync",
            MessageKind::Terminate => "Terminate",
            MessageKind::Authentication => "Authentication",
            MessageKind::BackendKeyData => "BackendKeyData",
            MessageKind::BindComplete => "BindComplete",
            MessageKind::CloseComplete => "CloseComplete",
            MessageKind::CommandComplete => "CommandComplete",
            MessageKind::CopyInResponse => "CopyInResponse",
            MessageKind::CopyOutResponse => "CopyOutResponse",
            MessageKind::CopyBothResponse => "CopyBothResponse",
            MessageKind::DataRow => "DataRow",
            MessageKind::EmptyQueryResponse => "EmptyQueryResponse",
            MessageKind::ErrorResponse => "ErrorResponse",
            MessageKind::FunctionCallResponse => "FunctionCallResponse",
            MessageKind::NegotiateProtocolVersion => "NegotiateProtocolVersion",
            MessageKind::NoData => "NoData",
            MessageKind::NoticeResponse => "NoticeResponse",
            MessageKind::NotificationResponse => "NotificationResponse",
            MessageKind::ParameterDescription => "ParameterDescription",
            MessageKind::ParameterStatus => "ParameterStatus",
            MessageKind::ParseComplete => "ParseComplete",
            MessageKind::PortalSuspended => "PortalSuspended",
            MessageKind::ReadyForQuery => "ReadyForQuery",
            MessageKind::RowDescription => "RowDescription",
            MessageKind::Unrecognized => "Unrecognized",
        }
    }

    /// Returns true for the tagless frames that open a connection.
    #[inline]
    pub fn is_startup(self) -> bool {
        matches!(
            self,
            MessageKind::StartupMessage
                | MessageKind::SslRequest
                | MessageKind::GssEncRequest
                | MessageKind::CancelRequest
        )
    }

    #[inline]
    pub fn is_recognized(self) -> bool {
        self != MessageKind::Unrecognized
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const REQUEST_TAGS: &[(u8, MessageKind)] = &[
    (b'B', MessageKind::Bind),
    (b'C', MessageKind::Close),
    (b'd', MessageKind::CopyData),
    (b'c', MessageKind::CopyDone),
    (b'f', MessageKind::CopyFail),
    (b'D', MessageKind::Describe),
    (b'E', MessageKind::Execute),
    (b'H', MessageKind::Flush),
    (b'F', MessageKind::FunctionCall),
    (b'P', MessageKind::Parse),
    (b'p', MessageKind::PasswordMessage),
    (b'Q', MessageKind::Query),
    (b'S', MessageKind::Sync),
    (b'X', MessageKind::Terminate),
];

const RESPONSE_TAGS: &[(u8, MessageKind)] = &[
    (b'R', MessageKind::Authentication),
    (b'K', MessageKind::BackendKeyData),
    (b'2', MessageKind::BindComplete),
    (b'3', MessageKind::CloseComplete),
    (b'C', MessageKind::CommandComplete),
    (b'd', MessageKind::CopyData),
    (b'c', MessageKind::CopyDone),
    (b'G', MessageKind::CopyInResponse),
    (b'H', MessageKind::CopyOutResponse),
    (b'W', MessageKind::CopyBothResponse),
    (b'D', MessageKind::DataRow),
    (b'I', MessageKind::EmptyQueryResponse),
    (b'E', MessageKind::ErrorResponse),
    (b'V', MessageKind::FunctionCallResponse),
    (b'v', MessageKind::NegotiateProtocolVersion),
    (b'n', MessageKind::NoData),
    (b'N', MessageKind::NoticeResponse),
    (b'A', MessageKind::NotificationResponse),
    (b't', MessageKind::ParameterDescription),
    (b'S', MessageKind::ParameterStatus),
    (b'1', MessageKind::ParseComplete),
    (b's', MessageKind::PortalSuspended),
    (b'Z', MessageKind::ReadyForQuery),
    (b'T', MessageKind::RowDescription),
];

const fn build_table(entries: &[(u8, MessageKind)]) -> [MessageKind; 256] {
    let mut table = [MessageKind::Unrecognized; 256];
    let mut i = 0;
    while i < entries.len() {
        table[entries[i].0 as usize] = entries[i].1;
        i += 1;
    }
    table
}

static REQUEST_TABLE: [MessageKind; 256] = build_table(REQUEST_TAGS);
static RESPONSE_TABLE: [MessageKind; 256] = build_table(RESPONSE_TAGS);

/// Classify a tag byte seen on `direction`.
#[inline]
pub fn classify(direction: Direction, tag: u8) -> MessageKind {
    match direction {
        Direction::Request => REQUEST_TABLE[tag as usize],
        Direction::Response => RESPONSE_TABLE[tag as usize],
    }
}
