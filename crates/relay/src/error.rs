//! Rejections answered on the HTTP side of `/ws`, before any socket exists.
//!
//! Every response carries the request id of the call that produced it so a
//! refused upgrade can be matched with its log line.

use std::fmt;
use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;
use wikisync_common::SessionId;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeRejection {
    /// Basic credentials were present but wrong or unreadable.
    InvalidCredentials,
    /// The caller is not in the `readers` list.
    NotReader,
    MissingSession,
    InvalidSession(String),
    UnknownSession(SessionId),
    /// The `wiki` key differs from the relay key or from the session's key.
    KeyMismatch(SessionId),
    /// The session was opened for a different user.
    ForeignSession(SessionId),
}

impl UpgradeRejection {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::NotReader => "NOT_A_READER",
            Self::MissingSession => "MISSING_SESSION",
            Self::InvalidSession(_) => "INVALID_SESSION",
            Self::UnknownSession(_) => "UNKNOWN_SESSION",
            Self::KeyMismatch(_) => "KEY_MISMATCH",
            Self::ForeignSession(_) => "FOREIGN_SESSION",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::KeyMismatch(_) => StatusCode::UNAUTHORIZED,
            Self::NotReader | Self::ForeignSession(_) => StatusCode::FORBIDDEN,
            Self::MissingSession | Self::InvalidSession(_) => StatusCode::BAD_REQUEST,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::UnknownSession(id) | Self::KeyMismatch(id) | Self::ForeignSession(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for UpgradeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials => f.write_str("invalid credentials"),
            Self::NotReader => f.write_str("caller may not read this wiki"),
            Self::MissingSession => f.write_str("missing `session` parameter"),
            Self::InvalidSession(reason) => write!(f, "invalid session: {reason}"),
            Self::UnknownSession(id) => write!(f, "unknown session {id}"),
            Self::KeyMismatch(_) => f.write_str("wiki key does not match the session"),
            Self::ForeignSession(_) => f.write_str("session belongs to another user"),
        }
    }
}

impl std::error::Error for UpgradeRejection {}

impl IntoResponse for UpgradeRejection {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let mut response = (
            self.status(),
            Json(json!({
                "error": {
                    "code": self.code(),
                    "message": self.to_string(),
                    "session": self.session().map(|id| id.to_string()),
                    "request_id": request_id.clone(),
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }
        response
    }
}

/// Runs `future` with `request_id` visible to [`current_request_id`].
pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;

    async fn body_json(rejection: UpgradeRejection) -> (StatusCode, Value) {
        let response = rejection.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("rejection body should be readable");
        (status, serde_json::from_slice(&body).expect("rejection body should be valid json"))
    }

    #[tokio::test]
    async fn rejection_carries_scoped_request_id_and_session() {
        let id = SessionId::new();
        let (status, parsed) = with_request_id_scope("req-scoped-123".to_owned(), async {
            body_json(UpgradeRejection::UnknownSession(id)).await
        })
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(parsed["error"]["code"], "UNKNOWN_SESSION");
        assert_eq!(parsed["error"]["session"], id.to_string());
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
    }

    #[tokio::test]
    async fn rejection_outside_a_request_has_no_id() {
        let (status, parsed) = body_json(UpgradeRejection::MissingSession).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(parsed["error"]["message"], "missing `session` parameter");
        assert!(parsed["error"]["request_id"].is_null());
        assert!(parsed["error"]["session"].is_null());
    }

    #[test]
    fn statuses_follow_the_failed_check() {
        let id = SessionId::new();
        assert_eq!(UpgradeRejection::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(UpgradeRejection::KeyMismatch(id).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(UpgradeRejection::NotReader.status(), StatusCode::FORBIDDEN);
        assert_eq!(UpgradeRejection::ForeignSession(id).status(), StatusCode::FORBIDDEN);
        assert_eq!(UpgradeRejection::InvalidSession("x".into()).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn header_request_id_is_reused_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(request_id_from_headers_or_generate(&headers), "abc");

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("  "));
        assert!(Uuid::parse_str(&request_id_from_headers_or_generate(&headers)).is_ok());
    }
}
