//! Envelope-level helpers for consumers and test tooling.
//!
//! The framer never looks inside a payload. These helpers pull out the few
//! strings a query report needs (statement text, command tag, error summary,
//! startup parameters) and build frames for tests and benches. Bind
//! parameter values and row contents are deliberately left alone.

use bytes::{BufMut, Bytes, BytesMut};

use super::framing::SSL_REQUEST_CODE;

/// Protocol version 3.0 as sent in a StartupMessage.
pub const PROTOCOL_VERSION_3: i32 = 196_608;

/// Split a cstring off the front of `b`.
fn cstr(b: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = b.iter().position(|&x| x == 0)?;
    Some((&b[..pos], &b[pos + 1..]))
}

/// SQL text of a `Query` payload.
pub fn query_text(payload: &[u8]) -> String {
    let sql = cstr(payload).map_or(payload, |(s, _)| s);
    String::from_utf8_lossy(sql).into_owned()
}

/// `(statement name, SQL text)` of a `Parse` payload.
pub fn parse_statement(payload: &[u8]) -> Option<(String, String)> {
    let (name, rest) = cstr(payload)?;
    let (sql, _) = cstr(rest)?;
    Some((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(sql).into_owned(),
    ))
}

/// `(portal, statement)` names a `Bind` payload refers to.
pub fn bind_target(payload: &[u8]) -> Option<(String, String)> {
    let (portal, rest) = cstr(payload)?;
    let (statement, _) = cstr(rest)?;
    Some((
        String::from_utf8_lossy(portal).into_owned(),
        String::from_utf8_lossy(statement).into_owned(),
    ))
}

/// Portal name of an `Execute` payload.
pub fn execute_portal(payload: &[u8]) -> Option<String> {
    let (portal, _) = cstr(payload)?;
    Some(String::from_utf8_lossy(portal).into_owned())
}

/// `(b'S' | b'P', name)` of a `Close` payload.
pub fn close_target(payload: &[u8]) -> Option<(u8, String)> {
    let (&target, rest) = payload.split_first()?;
    let (name, _) = cstr(rest)?;
    Some((target, String::from_utf8_lossy(name).into_owned()))
}

/// Command tag of a `CommandComplete` payload, e.g. `SELECT 3`.
pub fn command_tag(payload: &[u8]) -> String {
    query_text(payload)
}

/// Row count carried by a command tag (`INSERT 0 5` -> 5, `SELECT 3` -> 3).
pub fn command_tag_rows(tag: &str) -> Option<u64> {
    tag.rsplit(' ').next()?.parse().ok()
}

pub fn parse_error_response(payload: &[u8]) -> String {
    // fields: (code_byte, cstring) ... 0
    let mut b = payload;
    let mut msg = None;
    let mut sqlstate = None;

    while !b.is_empty() {
        let code = b[0];
        b = &b[1..];
        if code == 0 {
            break;
        }
        if let Some((value, rest)) = cstr(b) {
            let s = String::from_utf8_lossy(value).to_string();
            if code == b'M' {
                msg = Some(s);
            } else if code == b'C' {
                sqlstate = Some(s);
            }
            b = rest;
        } else {
            break;
        }
    }

    match (msg, sqlstate) {
        (Some(m), Some(c)) => format!("{m} (SQLSTATE {c})"),
        (Some(m), None) => m,
        _ => "unknown server error".to_string(),
    }
}

/// Key/value parameters of a StartupMessage body (protocol version first).
pub fn startup_parameters(body: &[u8]) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let Some(mut b) = body.get(4..) else {
        return params;
    };
    while let Some((key, rest)) = cstr(b) {
        if key.is_empty() {
            break;
        }
        let Some((value, rest)) = cstr(rest) else {
            break;
        };
        params.push((
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
        b = rest;
    }
    params
}

/// Build an ordinary frame: tag, length, payload.
pub fn encode_message(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(0); // length placeholder
    buf.extend_from_slice(payload);

    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf.freeze()
}

pub fn encode_startup_message(protocol_version: i32, params: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(protocol_version);

    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf.freeze()
}

pub fn encode_ssl_request() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32(8);
    buf.put_u32(SSL_REQUEST_CODE);
    buf.freeze()
}
