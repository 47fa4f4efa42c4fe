//! Server-side routing of authenticated frames to documents.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wikisync_common::engine::{is_empty_update, read_sync_message, DocumentEngine, UpdateOrigin};
use wikisync_common::error::ProtocolError;
use wikisync_common::protocol::{
    resolve_doc_name, Envelope, HandshakePayload, Heartbeat, Message, SyncMessage,
};
use wikisync_common::types::{now_millis, CLOSE_PROTOCOL_ERROR};

use crate::session::{Outbound, Session};
use crate::sync::{Registry, SharedDocument};

/// Consecutive malformed or invalid frames tolerated before closing with 1002.
pub const MAX_FRAME_FAULTS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Handled,
    /// The frame was logged and ignored; the connection stays open.
    Dropped(ProtocolError),
    /// The connection has been told to close.
    Closed(ProtocolError),
}

/// One socket's view of a session: which documents it has attached.
pub struct Connection {
    session: Arc<Session>,
    generation: u64,
    docs: HashMap<String, Arc<SharedDocument>>,
}

impl Connection {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attached_documents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.docs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    session_ttl: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, session_ttl: Duration) -> Self {
        Self { registry, session_ttl }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Binds a freshly upgraded socket to `session` and starts its heartbeat.
    pub fn open(&self, session: Arc<Session>, outbound: mpsc::UnboundedSender<Outbound>) -> Connection {
        let generation = session.bind_transport(outbound);
        session.heartbeat();
        Connection { session, generation, docs: HashMap::new() }
    }

    /// Releases the socket and detaches from every document it touched.
    pub async fn close(&self, connection: Connection) {
        let Connection { session, generation, docs } = connection;
        session.release_transport(generation);
        for (name, doc) in docs {
            let outcome = self.registry.detach(&doc, session.id(), generation).await;
            debug!(session_id = %session.id(), doc = %name, ?outcome, "detached on close");
        }
        info!(session_id = %session.id(), connection = generation, "connection closed");
    }

    pub async fn handle_frame(&self, connection: &mut Connection, frame: &[u8]) -> FrameOutcome {
        let session = Arc::clone(&connection.session);
        if !session.is_current(connection.generation) {
            return FrameOutcome::Dropped(ProtocolError::TransportError(
                "connection no longer owns the session".into(),
            ));
        }

        let envelope = match session.authenticate(frame) {
            Ok(envelope) => envelope,
            Err(err @ ProtocolError::AuthenticationFailure(_)) => {
                session.reject(&err);
                return FrameOutcome::Closed(err);
            }
            Err(err) => return self.fault(&session, err),
        };
        session.touch();
        session.heartbeat();

        match self.dispatch(connection, envelope).await {
            Ok(()) => {
                session.reset_frame_faults();
                FrameOutcome::Handled
            }
            Err(err) => self.fault(&session, err),
        }
    }

    fn fault(&self, session: &Session, err: ProtocolError) -> FrameOutcome {
        let faults = session.record_frame_fault();
        warn!(session_id = %session.id(), faults, error = %err, "dropping frame");
        if faults >= MAX_FRAME_FAULTS {
            session.force_close(CLOSE_PROTOCOL_ERROR, "Too many invalid frames");
            return FrameOutcome::Closed(err);
        }
        FrameOutcome::Dropped(err)
    }

    async fn dispatch(&self, connection: &mut Connection, envelope: Envelope) -> Result<(), ProtocolError> {
        let message = envelope.message()?;
        let wire_name = envelope.doc_name;
        let name = resolve_doc_name(connection.session.room(), wire_name.as_deref())?;
        let session = Arc::clone(&connection.session);

        match message {
            Message::Handshake(payload) => {
                let expires = self.granted_expiry(payload.as_ref());
                session.complete_handshake(expires);
                session.send(&Message::handshake(expires), wire_name.as_deref());
                info!(session_id = %session.id(), doc = %name, expires, "handshake completed");

                let doc = self.ensure_attached(connection, &name, wire_name.as_deref()).await?;
                greet(&session, &doc, wire_name.as_deref()).await
            }
            Message::Heartbeat(Heartbeat::Ping) => {
                session.send(&Message::Heartbeat(Heartbeat::Pong), wire_name.as_deref());
                Ok(())
            }
            // The timer was already re-armed on authentication.
            Message::Heartbeat(Heartbeat::Pong) => Ok(()),
            Message::Auth(reason) => {
                debug!(session_id = %session.id(), ?reason, "auth message from peer");
                Ok(())
            }
            // Only document writes wait for the handshake; presence does not.
            message @ Message::Sync(_) if !session.is_handshaken() => {
                Err(ProtocolError::violation(format!("{} before handshake", message.kind())))
            }
            message => {
                let attached = connection.docs.contains_key(&name);
                let doc = self.ensure_attached(connection, &name, wire_name.as_deref()).await?;
                // Before the handshake the greeting is left to the handshake itself.
                if !attached && session.is_handshaken() {
                    greet(&session, &doc, wire_name.as_deref()).await?;
                }
                self.on_document_message(&session, &doc, message, wire_name.as_deref()).await
            }
        }
    }

    /// Expiry granted to the session: the client's request capped at
    /// `now + ttl`. Requests in the past fall back to the cap.
    fn granted_expiry(&self, payload: Option<&HandshakePayload>) -> i64 {
        let now = now_millis();
        let cap = now.saturating_add(i64::try_from(self.session_ttl.as_millis()).unwrap_or(i64::MAX));
        match payload {
            Some(payload) if payload.expires > now => payload.expires.min(cap),
            _ => cap,
        }
    }

    async fn ensure_attached(
        &self,
        connection: &mut Connection,
        name: &str,
        wire_name: Option<&str>,
    ) -> Result<Arc<SharedDocument>, ProtocolError> {
        if let Some(doc) = connection.docs.get(name) {
            return Ok(Arc::clone(doc));
        }
        let doc = self
            .registry
            .attach(name, &connection.session, connection.generation, wire_name.map(str::to_owned))
            .await
            .map_err(|err| ProtocolError::TransportError(format!("document `{name}` unavailable: {err:#}")))?;
        connection.docs.insert(name.to_owned(), Arc::clone(&doc));
        Ok(doc)
    }

    async fn on_document_message(
        &self,
        session: &Arc<Session>,
        doc: &SharedDocument,
        message: Message,
        wire_name: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let origin = UpdateOrigin::Session(session.id());
        match message {
            Message::Sync(SyncMessage::Step1(state_vector)) => {
                let state = doc.lock().await;
                let reply = read_sync_message(state.engine(), &SyncMessage::Step1(state_vector), &origin)?;
                if let Some(reply) = reply {
                    session.send(&reply, wire_name);
                    // A read-only peer's exchange completes with our step 2.
                    if session.read_only() {
                        session.mark_synced();
                    }
                }
                Ok(())
            }
            Message::Sync(SyncMessage::Step2(update)) => {
                if apply_and_fan_out(session, doc, &update).await? {
                    session.mark_synced();
                }
                Ok(())
            }
            Message::Sync(SyncMessage::Update(update)) => {
                apply_and_fan_out(session, doc, &update).await?;
                Ok(())
            }
            Message::Awareness(update) => {
                let mut state = doc.lock().await;
                let change = state.engine().apply_awareness_update(&update, &origin)?;
                if change.is_empty() {
                    return Ok(());
                }
                state.track_awareness(session.id(), &change);
                let changed = state.engine().encode_awareness_update(&change.changed())?;
                state.broadcast(&Message::Awareness(changed), Some(session.id()));
                Ok(())
            }
            Message::QueryAwareness => {
                let state = doc.lock().await;
                if let Some(snapshot) = state.engine().encode_awareness_snapshot()? {
                    session.send(&Message::Awareness(snapshot), wire_name);
                }
                Ok(())
            }
            Message::Handshake(_) | Message::Heartbeat(_) | Message::Auth(_) => Ok(()),
        }
    }
}

/// Applies a peer's update and forwards it to everyone else on the document.
/// Returns `false` when the update was discarded because the session is
/// read-only.
async fn apply_and_fan_out(
    session: &Session,
    doc: &SharedDocument,
    update: &[u8],
) -> Result<bool, ProtocolError> {
    if session.read_only() {
        debug!(session_id = %session.id(), doc = doc.name(), "ignoring update from read-only session");
        return Ok(false);
    }
    let mut state = doc.lock().await;
    state.apply_update(update, &UpdateOrigin::Session(session.id()))?;
    if !is_empty_update(update) {
        state.broadcast(&Message::Sync(SyncMessage::Update(update.to_vec())), Some(session.id()));
    }
    Ok(true)
}

/// Opens sync with a peer on `doc`: our state vector, then who is present.
async fn greet(session: &Session, doc: &SharedDocument, wire_name: Option<&str>) -> Result<(), ProtocolError> {
    let state = doc.lock().await;
    session.send(&Message::Sync(SyncMessage::Step1(state.engine().write_step1())), wire_name);
    if let Some(snapshot) = state.engine().encode_awareness_snapshot()? {
        session.send(&Message::Awareness(snapshot), wire_name);
    }
    Ok(())
}
