use thiserror::Error;

use crate::engine::EngineError;
use crate::protocol::lib0::CodecError;
use crate::types::{CLOSE_HEARTBEAT_TIMEOUT, CLOSE_INVALID_SESSION};

/// Why an otherwise readable frame failed session authentication.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("session expired at {expires} (now {now})")]
    Expired { expires: i64, now: i64 },
    #[error("frame does not belong to this session")]
    SessionMismatch,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailure(AuthFailure),
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("transport error: {0}")]
    TransportError(String),
}

impl ProtocolError {
    pub fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    /// Close code the connection must be force-closed with, if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::AuthenticationFailure(_) => Some(CLOSE_INVALID_SESSION),
            Self::HeartbeatTimeout => Some(CLOSE_HEARTBEAT_TIMEOUT),
            _ => None,
        }
    }

    /// Terminal errors end the session without reconnecting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthenticationFailure(_))
    }

    /// Per-frame faults are dropped without tearing down the connection.
    pub fn is_frame_fault(&self) -> bool {
        matches!(self, Self::MalformedFrame(_) | Self::ProtocolViolation(_))
    }
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(err: yrs::encoding::read::Error) -> Self {
        Self::MalformedFrame(err.into())
    }
}

impl From<EngineError> for ProtocolError {
    fn from(err: EngineError) -> Self {
        Self::ProtocolViolation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_follow_error_kind() {
        let auth = ProtocolError::AuthenticationFailure(AuthFailure::SessionMismatch);
        assert_eq!(auth.close_code(), Some(4023));
        assert!(auth.is_terminal());

        assert_eq!(ProtocolError::HeartbeatTimeout.close_code(), Some(4000));
        assert!(!ProtocolError::HeartbeatTimeout.is_terminal());

        let malformed = ProtocolError::from(CodecError::InvalidUtf8);
        assert_eq!(malformed.close_code(), None);
        assert!(malformed.is_frame_fault());
        assert!(!ProtocolError::TransportError("reset".into()).is_frame_fault());
    }

    #[test]
    fn auth_failures_describe_themselves() {
        let expired = ProtocolError::AuthenticationFailure(AuthFailure::Expired { expires: 10, now: 12 });
        assert_eq!(expired.to_string(), "authentication failed: session expired at 10 (now 12)");
        assert_eq!(
            AuthFailure::SessionMismatch.to_string(),
            "frame does not belong to this session"
        );
    }
}
