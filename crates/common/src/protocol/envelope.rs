//! Outer frame: `[varString sessionId][any docName][raw inner message]`.

use yrs::encoding::read::Cursor;
use yrs::encoding::write::Write;

use super::lib0::{read_doc_name, read_str, write_doc_name};
use super::message::Message;
use crate::error::ProtocolError;
use crate::types::SessionId;

/// A decoded frame whose session has not been checked yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Session id exactly as it appeared on the wire.
    pub session_id: String,
    /// `None` addresses the session's default document.
    pub doc_name: Option<String>,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn message(&self) -> Result<Message, ProtocolError> {
        Message::decode(&self.payload)
    }
}

pub fn encode_envelope(session_id: SessionId, doc_name: Option<&str>, payload: &[u8]) -> Vec<u8> {
    encode_raw_envelope(&session_id.to_string(), doc_name, payload)
}

/// Encodes with an arbitrary session id string.
pub fn encode_raw_envelope(session_id: &str, doc_name: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(session_id.len() + payload.len() + 16);
    buf.write_string(session_id);
    write_doc_name(&mut buf, doc_name);
    buf.write_all(payload);
    buf
}

pub fn encode_frame(session_id: SessionId, doc_name: Option<&str>, message: &Message) -> Vec<u8> {
    encode_envelope(session_id, doc_name, &message.encode())
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    let session_id = read_str(&mut cursor)?;
    let doc_name = read_doc_name(&mut cursor)?;
    let payload = bytes[cursor.next..].to_vec();
    Ok(Envelope { session_id, doc_name, payload })
}

/// Canonical name of the document a frame addresses inside `room`.
///
/// `None` and `room` itself address the room's default document; any other
/// name must live below it as `room/...`.
pub fn resolve_doc_name(room: &str, wire_name: Option<&str>) -> Result<String, ProtocolError> {
    match wire_name {
        None => Ok(room.to_owned()),
        Some(name) if name == room => Ok(name.to_owned()),
        Some(name)
            if name.strip_prefix(room).is_some_and(|rest| rest.starts_with('/') && rest.len() > 1) =>
        {
            Ok(name.to_owned())
        }
        Some(name) => {
            Err(ProtocolError::violation(format!("document `{name}` is outside room `{room}`")))
        }
    }
}
