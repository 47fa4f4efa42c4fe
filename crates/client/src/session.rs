//! Client side of a relay session: connection state, open documents and
//! the events an embedding application observes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use wikisync_common::binding::{Record, RecordBinding};
use wikisync_common::engine::{is_empty_update, DocumentEngine, YrsEngine};
use wikisync_common::error::{AuthFailure, ProtocolError};
use wikisync_common::heartbeat::{HeartbeatTarget, HeartbeatTimer};
use wikisync_common::protocol::{
    decode_envelope, encode_frame, resolve_doc_name, Envelope, Heartbeat, Message, SyncMessage,
};
use wikisync_common::settings::{HeartbeatSettings, SessionSettings};
use wikisync_common::types::{
    now_millis, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_INVALID_SESSION, CLOSE_NORMAL,
};
use wikisync_common::{ConnectionState, SessionId};
use yrs::TransactionMut;

use crate::config::{ClientConfig, ConfigError};
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};

const EVENT_CAPACITY: usize = 64;

/// Work queued for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(ConnectionState),
    Closed { code: u16, reason: String },
    /// The relay confirmed the session until `expires` (unix ms).
    Handshake { expires: i64 },
    Synced(bool),
    PermissionDenied(String),
    /// Reconnecting stopped for good; local edits are no longer shared.
    Desynced,
}

pub struct ClientSession {
    id: SessionId,
    room: String,
    ttl: Duration,
    gc_enabled: bool,
    heartbeat_settings: HeartbeatSettings,
    policy: ReconnectPolicy,
    inner: Mutex<SessionInner>,
    docs: Mutex<BTreeMap<String, Arc<YrsEngine>>>,
    events: broadcast::Sender<SessionEvent>,
    /// Level-triggered: `true` while a disconnect is pending.
    stop: watch::Sender<bool>,
}

struct SessionInner {
    state: ConnectionState,
    expires: i64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// A socket opened and has not reported its close yet.
    opened: bool,
    handshaken: bool,
    synced: bool,
    unsuccessful_reconnects: u32,
    should_connect: bool,
    last_message_received: Option<i64>,
    heartbeat: Option<HeartbeatTimer>,
}

impl ClientSession {
    pub fn new(id: SessionId, room: impl Into<String>, settings: &SessionSettings, ttl: Duration) -> Self {
        Self::with_gc(id, room, settings, ttl, true)
    }

    pub fn with_gc(
        id: SessionId,
        room: impl Into<String>,
        settings: &SessionSettings,
        ttl: Duration,
        gc_enabled: bool,
    ) -> Self {
        let room = room.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let docs = BTreeMap::from([(room.clone(), Arc::new(YrsEngine::new(gc_enabled)))]);
        Self {
            id,
            room,
            ttl,
            gc_enabled,
            heartbeat_settings: settings.heartbeat,
            policy: ReconnectPolicy::from(settings.reconnect),
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Disconnected,
                expires: now_millis(),
                outbound: None,
                opened: false,
                handshaken: false,
                synced: false,
                unsuccessful_reconnects: 0,
                should_connect: true,
                last_message_received: None,
                heartbeat: None,
            }),
            docs: Mutex::new(docs),
            events,
            stop: watch::channel(false).0,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        let id = config.session_id.ok_or(ConfigError::MissingSession)?;
        Ok(Self::with_gc(
            id,
            config.room.clone(),
            &config.session,
            config.session_ttl(),
            config.gc_enabled,
        ))
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_docs(&self) -> MutexGuard<'_, BTreeMap<String, Arc<YrsEngine>>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn expires(&self) -> i64 {
        self.lock().expires
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

    pub fn is_synced(&self) -> bool {
        self.lock().synced
    }

    pub fn unsuccessful_reconnects(&self) -> u32 {
        self.lock().unsuccessful_reconnects
    }

    pub fn should_connect(&self) -> bool {
        self.lock().should_connect
    }

    pub fn last_message_received(&self) -> Option<i64> {
        self.lock().last_message_received
    }

    // ── Documents ──────────────────────────────────────────────────────

    /// The room's own document, always open.
    pub fn default_doc(&self) -> Arc<YrsEngine> {
        match self.doc(&self.room) {
            Some(engine) => engine,
            None => self.insert_doc(&self.room),
        }
    }

    pub fn doc(&self, name: &str) -> Option<Arc<YrsEngine>> {
        self.lock_docs().get(name).cloned()
    }

    pub fn doc_names(&self) -> Vec<String> {
        self.lock_docs().keys().cloned().collect()
    }

    fn insert_doc(&self, name: &str) -> Arc<YrsEngine> {
        let gc_enabled = self.gc_enabled;
        let mut docs = self.lock_docs();
        Arc::clone(
            docs.entry(name.to_owned()).or_insert_with(|| Arc::new(YrsEngine::new(gc_enabled))),
        )
    }

    /// Opens `name` (the room or `room/...`) on this connection. Syncs it
    /// right away when the handshake is already done.
    pub fn open_doc(&self, name: &str) -> Result<Arc<YrsEngine>, ProtocolError> {
        let name = resolve_doc_name(&self.room, Some(name))?;
        if let Some(engine) = self.doc(&name) {
            return Ok(engine);
        }
        let engine = self.insert_doc(&name);
        if self.is_handshaken() {
            self.greet(&name, &engine);
        }
        debug!(session_id = %self.id, doc = %name, "document opened");
        Ok(engine)
    }

    fn require_doc(&self, name: &str) -> Result<Arc<YrsEngine>, ProtocolError> {
        self.doc(name).ok_or_else(|| ProtocolError::violation(format!("document `{name}` is not open")))
    }

    /// Envelope doc name for `name`: the room's document travels as `None`.
    fn wire_name<'a>(&self, name: &'a str) -> Option<&'a str> {
        (name != self.room).then_some(name)
    }

    /// Runs a local edit on `doc` and shares the resulting update.
    pub fn transact<F>(&self, doc: &str, mutate: F) -> Result<Vec<u8>, ProtocolError>
    where
        F: FnOnce(&mut TransactionMut<'_>),
    {
        let engine = self.require_doc(doc)?;
        let update = engine.transact_local(mutate);
        self.share_update(doc, &update);
        Ok(update)
    }

    pub fn save_record(&self, doc: &str, record: &Record) -> Result<Vec<u8>, ProtocolError> {
        let engine = self.require_doc(doc)?;
        let update = RecordBinding::new(&engine).save(record);
        self.share_update(doc, &update);
        Ok(update)
    }

    /// Returns `None` when no such record exists.
    pub fn delete_record(&self, doc: &str, title: &str) -> Result<Option<Vec<u8>>, ProtocolError> {
        let engine = self.require_doc(doc)?;
        let update = RecordBinding::new(&engine).delete(title);
        if let Some(update) = &update {
            self.share_update(doc, update);
        }
        Ok(update)
    }

    /// Offline edits are not queued; the next sync exchange carries them.
    fn share_update(&self, doc: &str, update: &[u8]) {
        if !is_empty_update(update) {
            self.send_to(doc, &Message::Sync(SyncMessage::Update(update.to_vec())));
        }
    }

    /// Publishes this client's presence on `doc`.
    pub fn set_local_presence(&self, doc: &str, state: &Value) -> Result<(), ProtocolError> {
        let update = self.require_doc(doc)?.set_local_awareness(state)?;
        self.send_to(doc, &Message::Awareness(update));
        Ok(())
    }

    pub fn clear_local_presence(&self, doc: &str) -> Result<(), ProtocolError> {
        let update = self.require_doc(doc)?.clear_local_awareness()?;
        self.send_to(doc, &Message::Awareness(update));
        Ok(())
    }

    /// Step 1 for `name`, then our own presence if we have one.
    fn greet(&self, name: &str, engine: &YrsEngine) {
        self.send_to(name, &Message::Sync(SyncMessage::Step1(engine.write_step1())));
        let own = engine.client_id();
        if engine.awareness_client_ids().contains(&own) {
            match engine.encode_awareness_update(&[own]) {
                Ok(update) => {
                    self.send_to(name, &Message::Awareness(update));
                }
                Err(err) => warn!(session_id = %self.id, doc = %name, error = %err, "cannot encode presence"),
            }
        }
    }

    // ── Frames ─────────────────────────────────────────────────────────

    /// Checks that `frame` belongs to this live session.
    pub fn authenticate(&self, frame: &[u8]) -> Result<Envelope, ProtocolError> {
        let envelope = decode_envelope(frame)?;
        if !self.id.matches_wire(&envelope.session_id) {
            return Err(ProtocolError::AuthenticationFailure(AuthFailure::SessionMismatch));
        }
        let now = now_millis();
        let expires = self.expires();
        if now >= expires {
            return Err(ProtocolError::AuthenticationFailure(AuthFailure::Expired { expires, now }));
        }
        Ok(envelope)
    }

    /// Answers an authentication failure: permission denied, then close 4023.
    pub fn reject(&self, failure: &ProtocolError) {
        warn!(session_id = %self.id, error = %failure, "rejecting relay frame");
        self.send(
            &Message::permission_denied("WebSocket Authentication Error - Invalid Server Message"),
            None,
        );
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

    /// Sends `message` addressed to the open document `doc`.
    pub fn send_to(&self, doc: &str, message: &Message) -> bool {
        self.send(message, self.wire_name(doc))
    }

    /// (Re)arms the ping and timeout timers.
    pub fn heartbeat(self: &Arc<Self>) {
        let timer = HeartbeatTimer::arm(self.heartbeat_settings, Arc::downgrade(self));
        let mut inner = self.lock();
        if inner.state.is_ready() {
            inner.heartbeat = Some(timer);
        }
    }

    /// Closes the socket with `code`. The close itself is reported through
    /// [`ClientSession::on_close`] once the transport sees it.
    pub fn force_close(&self, code: u16, reason: &str) {
        let mut inner = self.lock();
        inner.state = ConnectionState::Disconnected;
        inner.handshaken = false;
        inner.heartbeat = None;
        if let Some(outbound) = inner.outbound.take() {
            info!(session_id = %self.id, code, reason, "closing relay socket");
            let _ = outbound.send(Outbound::Close { code, reason: reason.to_owned() });
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Allows the transport to (re)open connections.
    pub fn connect(&self) {
        self.lock().should_connect = true;
        self.stop.send_replace(false);
    }

    /// Stops reconnecting and closes the socket normally if connected.
    pub fn disconnect(&self) {
        let ready = {
            let mut inner = self.lock();
            inner.should_connect = false;
            inner.state.is_ready()
        };
        if ready {
            self.force_close(CLOSE_NORMAL, &format!("Session: {} closed by the client", self.id));
        }
        self.stop.send_replace(true);
    }

    /// Resolves once [`ClientSession::disconnect`] has been called and no
    /// later [`ClientSession::connect`] undid it.
    pub(crate) async fn stopped(&self) {
        let mut stop = self.stop.subscribe();
        // The sender lives in `self`, so this only fails if it was dropped.
        let _ = stop.wait_for(|stop| *stop).await;
    }

    /// Start of a connection attempt. Returns false once disconnected for good.
    pub fn begin_connect(&self) -> bool {
        let was_synced = {
            let mut inner = self.lock();
            if !inner.should_connect {
                return false;
            }
            inner.state = ConnectionState::Connecting;
            std::mem::take(&mut inner.synced)
        };
        if was_synced {
            self.emit(SessionEvent::Synced(false));
        }
        self.emit(SessionEvent::Status(ConnectionState::Connecting));
        true
    }

    /// Takes ownership of a freshly opened socket writer and declares our
    /// expiry with a handshake.
    pub fn on_open(&self, outbound: mpsc::UnboundedSender<Outbound>) {
        let expires = now_millis() + i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        {
            let mut inner = self.lock();
            inner.outbound = Some(outbound);
            inner.state = ConnectionState::Connected;
            inner.opened = true;
            inner.handshaken = false;
            inner.unsuccessful_reconnects = 0;
            inner.expires = expires;
        }
        info!(session_id = %self.id, room = %self.room, "relay socket opened");
        self.send(&Message::handshake(expires), None);
        self.emit(SessionEvent::Status(ConnectionState::Connected));
    }

    /// The relay's handshake: adopt its expiry, start the heartbeat and sync
    /// every open document.
    pub fn complete_handshake(self: &Arc<Self>, expires: i64) {
        {
            let mut inner = self.lock();
            inner.expires = expires;
            inner.handshaken = true;
        }
        self.heartbeat();

        let docs: Vec<(String, Arc<YrsEngine>)> =
            self.lock_docs().iter().map(|(name, engine)| (name.clone(), Arc::clone(engine))).collect();
        for (name, engine) in &docs {
            self.greet(name, engine);
        }
        info!(session_id = %self.id, expires, docs = docs.len(), "handshake completed");
        self.emit(SessionEvent::Handshake { expires });
    }

    /// Connected becomes synced once a sync step 2 arrived after the handshake.
    pub fn mark_synced(&self) {
        let newly_synced = {
            let mut inner = self.lock();
            if inner.handshaken && inner.state == ConnectionState::Connected {
                inner.state = ConnectionState::Synced;
            }
            inner.state == ConnectionState::Synced && !std::mem::replace(&mut inner.synced, true)
        };
        if newly_synced {
            self.emit(SessionEvent::Status(ConnectionState::Synced));
            self.emit(SessionEvent::Synced(true));
        }
    }

    pub fn permission_denied(&self, reason: &str) {
        warn!(session_id = %self.id, reason, "permission denied by relay");
        self.emit(SessionEvent::PermissionDenied(reason.to_owned()));
    }

    /// The socket closed with `code`. Releases it, forgets remote presence
    /// and decides whether to reconnect.
    pub fn on_close(&self, code: u16, reason: &str) -> ReconnectDecision {
        let (was_open, unsuccessful, should_connect) = {
            let mut inner = self.lock();
            inner.outbound = None;
            inner.heartbeat = None;
            inner.state = ConnectionState::Disconnected;
            inner.handshaken = false;
            let was_open = std::mem::take(&mut inner.opened);
            if !was_open {
                inner.unsuccessful_reconnects += 1;
            }
            (was_open, inner.unsuccessful_reconnects, inner.should_connect)
        };

        if was_open {
            for engine in self.lock_docs().values() {
                engine.clear_remote_awareness();
            }
        }

        let decision = if should_connect {
            self.policy.decide(code, unsuccessful, &mut rand::thread_rng())
        } else {
            ReconnectDecision::Stop
        };
        info!(session_id = %self.id, code, reason, unsuccessful, ?decision, "relay socket closed");

        if decision == ReconnectDecision::GiveUp {
            let was_synced = {
                let mut inner = self.lock();
                inner.unsuccessful_reconnects = 0;
                inner.should_connect = false;
                std::mem::take(&mut inner.synced)
            };
            if was_synced {
                self.emit(SessionEvent::Synced(false));
            }
            warn!(session_id = %self.id, code, "session desynced");
            self.emit(SessionEvent::Desynced);
        }
        self.emit(SessionEvent::Closed { code, reason: reason.to_owned() });
        self.emit(SessionEvent::Status(ConnectionState::Disconnected));
        decision
    }
}

impl HeartbeatTarget for ClientSession {
    fn send_ping(&self) {
        self.send(&Message::Heartbeat(Heartbeat::Ping), None);
    }

    fn heartbeat_timed_out(&self) {
        if self.is_ready() {
            warn!(
                session_id = %self.id,
                last_message_received = ?self.last_message_received(),
                "heartbeat timeout, closing relay socket"
            );
            self.force_close(CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat Timeout");
        }
    }
}
