//! `/ws` upgrade route and per-socket protocol handling.

mod dispatch;
mod handler;

use std::sync::Arc;

use axum::{http::HeaderMap, routing::get, Router};
use serde::Deserialize;
use tracing::warn;
use wikisync_common::SessionId;

pub use dispatch::{Connection, Dispatcher, FrameOutcome, MAX_FRAME_FAULTS};

use crate::auth::{AuthDecision, Scope};
use crate::error::UpgradeRejection;
use crate::session::Session;
use crate::RelayState;

/// Query string of `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpgradeParams {
    pub session: Option<String>,
    /// Room secret presented by the client.
    pub wiki: Option<String>,
}

pub fn router(state: RelayState) -> Router {
    Router::new().route("/ws", get(handler::ws_upgrade)).with_state(state)
}

/// Checks an upgrade request before any socket is opened and returns the
/// session it may bind to.
pub async fn verify_upgrade(
    state: &RelayState,
    headers: &HeaderMap,
    params: &UpgradeParams,
) -> Result<Arc<Session>, UpgradeRejection> {
    let username = match state.auth.authenticate_request(headers) {
        AuthDecision::Authenticated(username) => username,
        AuthDecision::Rejected => return Err(UpgradeRejection::InvalidCredentials),
    };
    if !state.auth.is_authorized(Scope::Readers, username.as_deref()) {
        return Err(UpgradeRejection::NotReader);
    }

    let session_id: SessionId = params
        .session
        .as_deref()
        .ok_or(UpgradeRejection::MissingSession)?
        .parse()
        .map_err(|err| UpgradeRejection::InvalidSession(format!("{err}")))?;
    let session = state
        .sessions
        .get(session_id)
        .await
        .ok_or(UpgradeRejection::UnknownSession(session_id))?;

    let request_key = params.wiki.as_deref().unwrap_or_default();
    if request_key != state.api_key.as_ref() || state.api_key.as_ref() != session.key() {
        warn!(session_id = %session_id, "upgrade presented a key that does not match the session");
        return Err(UpgradeRejection::KeyMismatch(session_id));
    }
    if session.username() != username.as_deref() {
        warn!(session_id = %session_id, "upgrade user does not own the session");
        return Err(UpgradeRejection::ForeignSession(session_id));
    }

    state.sessions.refresh_session(session_id, state.session_ttl).await;
    Ok(session)
}
