//! Server-side sessions and the process-wide session store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use wikisync_common::error::{AuthFailure, ProtocolError};
use wikisync_common::heartbeat::{HeartbeatTarget, HeartbeatTimer};
use wikisync_common::protocol::{decode_envelope, encode_frame, Envelope, Heartbeat, Message};
use wikisync_common::settings::HeartbeatSettings;
use wikisync_common::types::{
    now_millis, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_INVALID_SESSION, CLOSE_NORMAL,
};
use wikisync_common::{ConnectionState, SessionId};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Work queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close { code: u16, reason: String },
}

/// One participant's authenticated session. Outlives individual sockets.
pub struct Session {
    id: SessionId,
    room: String,
    key: String,
    username: Option<String>,
    read_only: bool,
    heartbeat_settings: HeartbeatSettings,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: ConnectionState,
    expires: i64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// Bumped every time a new socket is bound.
    connection: u64,
    handshaken: bool,
    last_message_received: Option<i64>,
    heartbeat: Option<HeartbeatTimer>,
    frame_faults: u32,
}

impl Session {
    pub fn new(
        id: SessionId,
        room: impl Into<String>,
        key: impl Into<String>,
        username: Option<String>,
        read_only: bool,
        expires: i64,
        heartbeat_settings: HeartbeatSettings,
    ) -> Self {
        Self {
            id,
            room: room.into(),
            key: key.into(),
            username,
            read_only,
            heartbeat_settings,
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Disconnected,
                expires,
                outbound: None,
                connection: 0,
                handshaken: false,
                last_message_received: None,
                heartbeat: None,
                frame_faults: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Document group this session may address.
    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn expires(&self) -> i64 {
        self.lock().expires
    }

    pub fn set_expires(&self, expires: i64) {
        self.lock().expires = expires;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.lock().state.is_ready()
    }

    pub fn is_handshaken(&self) -> bool {
        self.lock().handshaken
    }

    pub fn last_message_received(&self) -> Option<i64> {
        self.lock().last_message_received
    }

    /// Whether `connection` is the socket currently bound to this session.
    pub fn is_current(&self, connection: u64) -> bool {
        let inner = self.lock();
        inner.connection == connection && inner.outbound.is_some()
    }

    /// Takes ownership of a freshly opened socket writer, closing any
    /// previous one. Returns the connection generation.
    pub fn bind_transport(&self, outbound: mpsc::UnboundedSender<Outbound>) -> u64 {
        let mut inner = self.lock();
        if let Some(previous) = inner.outbound.take() {
            let _ = previous.send(Outbound::Close {
                code: CLOSE_NORMAL,
                reason: "Replaced by a new connection".into(),
            });
        }
        inner.connection += 1;
        inner.outbound = Some(outbound);
        inner.state = ConnectionState::Connected;
        inner.handshaken = false;
        inner.frame_faults = 0;
        inner.heartbeat = None;
        info!(session_id = %self.id, connection = inner.connection, "session connected");
        inner.connection
    }

    /// Releases the socket if `connection` is still the bound one.
    pub fn release_transport(&self, connection: u64) {
        let mut inner = self.lock();
        if inner.connection != connection {
            return;
        }
        inner.outbound = None;
        inner.state = ConnectionState::Disconnected;
        inner.handshaken = false;
        inner.heartbeat = None;
        debug!(session_id = %self.id, connection, "session transport released");
    }

    /// Checks that `frame` belongs to this live session.
    pub fn authenticate(&self, frame: &[u8]) -> Result<Envelope, ProtocolError> {
        let envelope = decode_envelope(frame)?;
        if !self.id.matches_wire(&envelope.session_id) {
            return Err(ProtocolError::AuthenticationFailure(AuthFailure::SessionMismatch));
        }
        let now = now_millis();
        let expires = self.expires();
        if now >= expires {
            return Err(ProtocolError::AuthenticationFailure(AuthFailure::Expired {
                expires,
                now,
            }));
        }
        Ok(envelope)
    }

    /// Answers an authentication failure: permission denied, then close 4023.
    pub fn reject(&self, failure: &ProtocolError) {
        warn!(session_id = %self.id, error = %failure, "rejecting frame");
        self.send(&Message::permission_denied(failure.to_string()), None);
        self.force_close(CLOSE_INVALID_SESSION, "Invalid session");
    }

    pub fn touch(&self) {
        self.lock().last_message_received = Some(now_millis());
    }

    /// Wraps `message` in this session's envelope and queues it.
    /// Returns false when nothing was queued.
    pub fn send(&self, message: &Message, doc_name: Option<&str>) -> bool {
        let mut inner = self.lock();
        if !inner.state.is_ready() {
            return false;
        }
        let Some(outbound) = inner.outbound.as_ref() else {
            return false;
        };
        let frame = encode_frame(self.id, doc_name, message);
        if outbound.send(Outbound::Frame(frame)).is_ok() {
            return true;
        }

        warn!(session_id = %self.id, kind = message.kind(), "socket writer gone, closing session");
        inner.outbound = None;
        inner.state = ConnectionState::Disconnected;
        inner.heartbeat = None;
        false
    }

    /// (Re)arms the ping and timeout timers.
    pub fn heartbeat(self: &Arc<Self>) {
        let timer = HeartbeatTimer::arm(self.heartbeat_settings, Arc::downgrade(self));
        let mut inner = self.lock();
        if inner.state.is_ready() {
            inner.heartbeat = Some(timer);
        }
    }

    pub fn complete_handshake(&self, expires: i64) {
        let mut inner = self.lock();
        inner.expires = expires;
        inner.handshaken = true;
    }

    /// Connected becomes synced once a sync step 2 arrived after the handshake.
    pub fn mark_synced(&self) {
        let mut inner = self.lock();
        if inner.handshaken && inner.state == ConnectionState::Connected {
            inner.state = ConnectionState::Synced;
        }
    }

    pub fn record_frame_fault(&self) -> u32 {
        let mut inner = self.lock();
        inner.frame_faults += 1;
        inner.frame_faults
    }

    pub fn reset_frame_faults(&self) {
        self.lock().frame_faults = 0;
    }

    /// Closes the bound socket with `code`. No-op without a socket.
    pub fn force_close(&self, code: u16, reason: &str) {
        let mut inner = self.lock();
        inner.state = ConnectionState::Disconnected;
        inner.handshaken = false;
        inner.heartbeat = None;
        if let Some(outbound) = inner.outbound.take() {
            info!(session_id = %self.id, code, reason, "closing session socket");
            let _ = outbound.send(Outbound::Close { code, reason: reason.to_owned() });
        }
    }

    /// Normal close if connected. Idempotent.
    pub fn disconnect(&self, reason: Option<&str>) {
        if self.is_ready() {
            self.force_close(CLOSE_NORMAL, reason.unwrap_or("Session closed"));
        }
    }
}

impl HeartbeatTarget for Session {
    fn send_ping(&self) {
        self.send(&Message::Heartbeat(Heartbeat::Ping), None);
    }

    fn heartbeat_timed_out(&self) {
        warn!(session_id = %self.id, "heartbeat timeout, disconnecting");
        self.force_close(CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat Timeout");
    }
}

/// Request to create or resume a session.
#[derive(Debug, Clone)]
pub struct OpenSession {
    /// Existing session to resume; `None` allocates a fresh id.
    pub id: Option<SessionId>,
    pub room: String,
    pub key: String,
    pub username: Option<String>,
    pub read_only: bool,
    pub ttl: Duration,
}

/// All sessions known to the relay, connected or not.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    heartbeat: HeartbeatSettings,
}

impl SessionStore {
    pub fn new(heartbeat: HeartbeatSettings) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), heartbeat }
    }

    /// Resumes a matching session (same room and user) or creates a new one.
    pub async fn open_session(&self, request: OpenSession) -> Arc<Session> {
        let expires = expires_after(request.ttl);
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = request.id.and_then(|id| sessions.get(&id)) {
            if existing.room() == request.room && existing.username() == request.username.as_deref()
            {
                existing.set_expires(expires);
                return Arc::clone(existing);
            }
        }

        let id = match request.id {
            Some(id) if !sessions.contains_key(&id) => id,
            _ => SessionId::new(),
        };
        let session = Arc::new(Session::new(
            id,
            request.room,
            request.key,
            request.username,
            request.read_only,
            expires,
            self.heartbeat,
        ));
        info!(session_id = %id, room = session.room(), "session opened");
        sessions.insert(id, Arc::clone(&session));
        session
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Extends a session to `now + ttl`. Returns the new expiry.
    pub async fn refresh_session(&self, id: SessionId, ttl: Duration) -> Option<i64> {
        let session = self.get(id).await?;
        let expires = expires_after(ttl);
        session.set_expires(expires);
        Some(expires)
    }

    pub async fn sessions_by_user(&self, username: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.username() == Some(username))
            .cloned()
            .collect()
    }

    pub async fn sessions_by_room(&self, room: &str) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().filter(|session| session.room() == room).cloned().collect()
    }

    /// Forgets the session and closes its socket.
    pub async fn close_session(&self, id: SessionId) -> bool {
        let Some(session) = self.sessions.write().await.remove(&id) else {
            return false;
        };
        session.disconnect(Some("Session closed"));
        info!(session_id = %id, "session closed");
        true
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn expires_after(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
