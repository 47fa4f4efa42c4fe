// Core protocol types shared by the relay and client crates.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Repeated malformed or invalid frames from the peer.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Transport dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// No pong or message within the heartbeat window.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;
/// Invalid or expired session. Terminal: peers must not reconnect.
pub const CLOSE_INVALID_SESSION: u16 = 4023;

/// Server-generated session identifier. Never the nil UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct SessionId(Uuid);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidSessionId {
    #[error("session id must not be nil")]
    Nil,
    #[error("session id `{0}` is not a UUID")]
    NotUuid(String),
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Result<Self, InvalidSessionId> {
        if uuid.is_nil() {
            return Err(InvalidSessionId::Nil);
        }
        Ok(Self(uuid))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Exact wire comparison against the id carried by an envelope.
    pub fn matches_wire(&self, wire: &str) -> bool {
        Uuid::parse_str(wire).is_ok_and(|uuid| uuid == self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Uuid> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(uuid: Uuid) -> Result<Self, Self::Error> {
        Self::from_uuid(uuid)
    }
}

impl From<SessionId> for Uuid {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(value).map_err(|_| InvalidSessionId::NotUuid(value.into()))?;
        Self::from_uuid(uuid)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Synced,
}

impl ConnectionState {
    /// Whether frames may be written to the peer.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Connected | Self::Synced)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Synced => "synced",
        })
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
