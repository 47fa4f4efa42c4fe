//! Client-side handling of frames received from the relay.

use std::sync::Arc;

use tracing::{debug, warn};
use wikisync_common::engine::{read_sync_message, DocumentEngine, UpdateOrigin};
use wikisync_common::error::ProtocolError;
use wikisync_common::protocol::{resolve_doc_name, Envelope, Heartbeat, Message, SyncMessage};

use crate::session::ClientSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Handled,
    /// Logged and ignored; the connection stays open.
    Dropped(ProtocolError),
    /// The socket has been told to close.
    Closed(ProtocolError),
}

/// Authenticates one binary frame from the relay and acts on it.
pub fn handle_frame(session: &Arc<ClientSession>, frame: &[u8]) -> FrameOutcome {
    let envelope = match session.authenticate(frame) {
        Ok(envelope) => envelope,
        Err(err) if err.is_terminal() => {
            session.reject(&err);
            return FrameOutcome::Closed(err);
        }
        Err(err) => {
            debug!(session_id = %session.id(), error = %err, "dropping unreadable frame");
            return FrameOutcome::Dropped(err);
        }
    };

    session.touch();
    if session.is_handshaken() {
        session.heartbeat();
    }

    match dispatch(session, &envelope) {
        Ok(()) => FrameOutcome::Handled,
        Err(err) => {
            warn!(
                session_id = %session.id(),
                doc = ?envelope.doc_name,
                error = %err,
                "dropping frame"
            );
            FrameOutcome::Dropped(err)
        }
    }
}

fn dispatch(session: &Arc<ClientSession>, envelope: &Envelope) -> Result<(), ProtocolError> {
    let message = envelope.message()?;
    let name = resolve_doc_name(session.room(), envelope.doc_name.as_deref())?;

    match message {
        Message::Handshake(Some(payload)) => {
            session.complete_handshake(payload.expires);
            Ok(())
        }
        Message::Handshake(None) => Err(ProtocolError::violation("handshake without expiry")),
        Message::Heartbeat(Heartbeat::Ping) => {
            session.send_to(&name, &Message::Heartbeat(Heartbeat::Pong));
            Ok(())
        }
        // Re-armed above.
        Message::Heartbeat(Heartbeat::Pong) => Ok(()),
        Message::Auth(Some(reason)) => {
            session.permission_denied(&reason);
            Ok(())
        }
        Message::Auth(None) => Ok(()),
        other if !session.is_handshaken() => {
            Err(ProtocolError::violation(format!("{} before handshake", other.kind())))
        }
        other => on_document_message(session, &name, other),
    }
}

fn on_document_message(
    session: &ClientSession,
    name: &str,
    message: Message,
) -> Result<(), ProtocolError> {
    let engine = session
        .doc(name)
        .ok_or_else(|| ProtocolError::violation(format!("document `{name}` is not open")))?;
    let origin = UpdateOrigin::Session(session.id());

    match message {
        Message::Sync(sync) => {
            if let Some(reply) = read_sync_message(engine.as_ref(), &sync, &origin)? {
                session.send_to(name, &reply);
            }
            if matches!(sync, SyncMessage::Step2(_)) {
                session.mark_synced();
            }
            Ok(())
        }
        Message::Awareness(update) => {
            engine.apply_awareness_update(&update, &origin)?;
            Ok(())
        }
        Message::QueryAwareness => {
            if let Some(snapshot) = engine.encode_awareness_snapshot()? {
                session.send_to(name, &Message::Awareness(snapshot));
            }
            Ok(())
        }
        Message::Handshake(_) | Message::Heartbeat(_) | Message::Auth(_) => Ok(()),
    }
}
