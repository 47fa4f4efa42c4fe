//! Inner protocol messages carried by the envelope payload.
//!
//! Sync and awareness frames are the y-sync messages of `yrs::sync`; auth,
//! query-awareness, handshake and heartbeat frames follow the same lib0
//! layout with the relay's own payloads.

use serde::{Deserialize, Serialize};
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::sync::protocol::{
    MSG_AUTH, MSG_AWARENESS, MSG_QUERY_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2,
    MSG_SYNC_UPDATE, PERMISSION_DENIED, PERMISSION_GRANTED,
};
use yrs::sync::{Message as YMessage, SyncMessage as YSyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;

use super::lib0::{read_str, CodecError};
use crate::error::ProtocolError;

pub const MESSAGE_SYNC: u8 = MSG_SYNC;
pub const MESSAGE_AWARENESS: u8 = MSG_AWARENESS;
pub const MESSAGE_AUTH: u8 = MSG_AUTH;
pub const MESSAGE_QUERY_AWARENESS: u8 = MSG_QUERY_AWARENESS;
pub const MESSAGE_HANDSHAKE: u8 = 4;
pub const MESSAGE_HEARTBEAT: u8 = 5;

const HEARTBEAT_PING: u8 = 0;
const HEARTBEAT_PONG: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector offer.
    Step1(Vec<u8>),
    /// Update covering the gap to a received state vector.
    Step2(Vec<u8>),
    /// Incremental update.
    Update(Vec<u8>),
}

/// JSON body of a handshake frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Unix milliseconds.
    pub expires: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    /// Permission denied with a reason, or a bare auth frame.
    Auth(Option<String>),
    QueryAwareness,
    Handshake(Option<HandshakePayload>),
    Heartbeat(Heartbeat),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(SyncMessage::Step1(_)) => "sync_step1",
            Self::Sync(SyncMessage::Step2(_)) => "sync_step2",
            Self::Sync(SyncMessage::Update(_)) => "sync_update",
            Self::Awareness(_) => "awareness",
            Self::Auth(_) => "auth",
            Self::QueryAwareness => "query_awareness",
            Self::Handshake(_) => "handshake",
            Self::Heartbeat(Heartbeat::Ping) => "ping",
            Self::Heartbeat(Heartbeat::Pong) => "pong",
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::Auth(Some(reason.into()))
    }

    pub fn handshake(expires: i64) -> Self {
        Self::Handshake(Some(HandshakePayload { expires }))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Sync(sync) => {
                let (sub_type, data) = match sync {
                    SyncMessage::Step1(data) => (MSG_SYNC_STEP_1, data),
                    SyncMessage::Step2(data) => (MSG_SYNC_STEP_2, data),
                    SyncMessage::Update(data) => (MSG_SYNC_UPDATE, data),
                };
                buf.write_var(MESSAGE_SYNC);
                buf.write_var(sub_type);
                buf.write_buf(data);
            }
            Self::Awareness(update) => {
                buf.write_var(MESSAGE_AWARENESS);
                buf.write_buf(update);
            }
            Self::Auth(reason) => {
                buf.write_var(MESSAGE_AUTH);
                if let Some(reason) = reason {
                    buf.write_var(PERMISSION_DENIED);
                    buf.write_string(reason);
                }
            }
            Self::QueryAwareness => buf.write_var(MESSAGE_QUERY_AWARENESS),
            Self::Handshake(payload) => {
                buf.write_var(MESSAGE_HANDSHAKE);
                if let Some(payload) = payload {
                    let json = serde_json::json!({ "expires": payload.expires });
                    buf.write_string(&json.to_string());
                }
            }
            Self::Heartbeat(beat) => {
                buf.write_var(MESSAGE_HEARTBEAT);
                buf.write_var(match beat {
                    Heartbeat::Ping => HEARTBEAT_PING,
                    Heartbeat::Pong => HEARTBEAT_PONG,
                });
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(payload);
        let message_type: u8 = cursor.read_var()?;
        match message_type {
            MESSAGE_SYNC | MESSAGE_AWARENESS => {
                check_entry_count(payload)?;
                let mut decoder = DecoderV1::new(Cursor::new(payload));
                let message = YMessage::decode(&mut decoder).map_err(|err| match err {
                    read::Error::UnexpectedValue => ProtocolError::violation("unknown sync sub-type"),
                    other => ProtocolError::from(other),
                })?;
                Self::from_sync_protocol(message)
            }
            MESSAGE_AUTH => {
                if !cursor.has_content() {
                    return Ok(Self::Auth(None));
                }
                match cursor.read_var::<u8>()? {
                    PERMISSION_DENIED => Ok(Self::Auth(Some(read_str(&mut cursor)?))),
                    PERMISSION_GRANTED => Ok(Self::Auth(None)),
                    other => Err(ProtocolError::violation(format!("unknown auth sub-type {other}"))),
                }
            }
            MESSAGE_QUERY_AWARENESS => Ok(Self::QueryAwareness),
            MESSAGE_HANDSHAKE => {
                if !cursor.has_content() {
                    return Ok(Self::Handshake(None));
                }
                let json = read_str(&mut cursor)?;
                let payload = serde_json::from_str::<HandshakePayload>(&json).map_err(|err| {
                    ProtocolError::violation(format!("invalid handshake payload: {err}"))
                })?;
                Ok(Self::Handshake(Some(payload)))
            }
            MESSAGE_HEARTBEAT => match cursor.read_var::<u8>()? {
                HEARTBEAT_PING => Ok(Self::Heartbeat(Heartbeat::Ping)),
                HEARTBEAT_PONG => Ok(Self::Heartbeat(Heartbeat::Pong)),
                other => Err(ProtocolError::violation(format!("unknown heartbeat sub-type {other}"))),
            },
            other => Err(ProtocolError::violation(format!("unknown message type {other}"))),
        }
    }

    fn from_sync_protocol(message: YMessage) -> Result<Self, ProtocolError> {
        match message {
            YMessage::Sync(YSyncMessage::SyncStep1(state_vector)) => {
                Ok(Self::Sync(SyncMessage::Step1(state_vector.encode_v1())))
            }
            YMessage::Sync(YSyncMessage::SyncStep2(update)) => Ok(Self::Sync(SyncMessage::Step2(update))),
            YMessage::Sync(YSyncMessage::Update(update)) => Ok(Self::Sync(SyncMessage::Update(update))),
            YMessage::Awareness(update) => Ok(Self::Awareness(update.encode_v1())),
            other => Err(ProtocolError::violation(format!("unexpected y-sync message {other:?}"))),
        }
    }
}

/// yrs sizes its maps from the declared entry count, so a count larger than
/// the bytes behind it is refused before decoding.
fn check_entry_count(payload: &[u8]) -> Result<(), ProtocolError> {
    let mut cursor = Cursor::new(payload);
    let message_type: u8 = cursor.read_var()?;
    if message_type == MESSAGE_SYNC && cursor.read_var::<u8>()? != MSG_SYNC_STEP_1 {
        return Ok(());
    }
    let data = cursor.read_buf()?;
    let count: u64 = Cursor::new(data).read_var()?;
    if count > data.len() as u64 {
        return Err(ProtocolError::MalformedFrame(CodecError::UnexpectedValue));
    }
    Ok(())
}
