//! Live shared documents, keyed by name.
//!
//! A document is created on first use, stays registered while any session
//! is attached or a persistence flush is running, and is evicted after the
//! last session leaves.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use wikisync_common::engine::{
    AwarenessChange, DocumentEngine, EngineError, UpdateOrigin, YrsEngine,
};
use wikisync_common::protocol::Message;
use wikisync_common::SessionId;

use super::persistence::PersistenceProvider;
use crate::session::Session;

type DocumentCell = Arc<OnceCell<Arc<SharedDocument>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    NotAttached,
    /// Other sessions remain, or the final flush failed.
    Retained,
    Evicted,
}

pub struct Registry {
    docs: Mutex<HashMap<String, DocumentCell>>,
    persistence: Option<Arc<dyn PersistenceProvider>>,
    gc_enabled: bool,
}

pub struct SharedDocument {
    name: String,
    state: tokio::sync::Mutex<DocumentState>,
}

/// Everything guarded by a document's lock.
pub struct DocumentState {
    name: String,
    engine: YrsEngine,
    sessions: HashMap<SessionId, Attachment>,
    persistence: Option<Arc<dyn PersistenceProvider>>,
    evicted: bool,
}

struct Attachment {
    session: Weak<Session>,
    connection: u64,
    /// Name the session uses for this document on the wire.
    wire_name: Option<String>,
    /// Awareness client ids announced through this session.
    controlled: HashSet<u64>,
}

impl SharedDocument {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, DocumentState> {
        self.state.lock().await
    }
}

impl DocumentState {
    pub fn engine(&self) -> &YrsEngine {
        &self.engine
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_attached(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn controlled_clients(&self, session_id: SessionId) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .sessions
            .get(&session_id)
            .map(|attachment| attachment.controlled.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Applies an update and hands it to persistence. Nothing is stored when
    /// the update does not decode.
    pub fn apply_update(&mut self, update: &[u8], origin: &UpdateOrigin) -> Result<(), EngineError> {
        self.engine.apply_update(update, origin)?;
        if let Some(persistence) = &self.persistence {
            persistence.store_update(&self.name, update);
        }
        Ok(())
    }

    /// Queues `message` to every attached session except `except`.
    /// Returns the number of sessions reached.
    pub fn broadcast(&self, message: &Message, except: Option<SessionId>) -> usize {
        let mut delivered = 0;
        for (session_id, attachment) in &self.sessions {
            if Some(*session_id) == except {
                continue;
            }
            let Some(session) = attachment.session.upgrade() else {
                continue;
            };
            if !session.is_current(attachment.connection) {
                continue;
            }
            if session.send(message, attachment.wire_name.as_deref()) {
                delivered += 1;
            }
        }
        debug!(doc = %self.name, kind = message.kind(), delivered, "broadcast");
        delivered
    }

    /// Records which awareness clients `session_id` speaks for.
    pub fn track_awareness(&mut self, session_id: SessionId, change: &AwarenessChange) {
        let Some(attachment) = self.sessions.get_mut(&session_id) else {
            return;
        };
        attachment.controlled.extend(change.added.iter().chain(&change.updated));
        for client_id in &change.removed {
            attachment.controlled.remove(client_id);
        }
    }
}

impl Registry {
    pub fn new(persistence: Option<Arc<dyn PersistenceProvider>>, gc_enabled: bool) -> Self {
        Self { docs: Mutex::new(HashMap::new()), persistence, gc_enabled }
    }

    /// Memory-only registry.
    pub fn in_memory() -> Self {
        Self::new(None, true)
    }

    fn docs(&self) -> MutexGuard<'_, HashMap<String, DocumentCell>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live document, creating and loading it if needed.
    /// Concurrent callers share a single instance.
    /// A failed load leaves nothing registered.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<SharedDocument>> {
        let cell = Arc::clone(self.docs().entry(name.to_owned()).or_default());
        match cell.get_or_try_init(|| self.create(name)).await {
            Ok(doc) => Ok(Arc::clone(doc)),
            Err(err) => {
                let mut docs = self.docs();
                // Other waiters on the same cell retry the load themselves.
                let abandoned = docs.get(name).is_some_and(|current| {
                    Arc::ptr_eq(current, &cell) && !current.initialized() && Arc::strong_count(current) == 2
                });
                if abandoned {
                    docs.remove(name);
                }
                Err(err)
            }
        }
    }

    async fn create(&self, name: &str) -> Result<Arc<SharedDocument>> {
        let engine = YrsEngine::new(self.gc_enabled);
        if let Some(persistence) = &self.persistence {
            let stored = persistence
                .bind_state(name)
                .await
                .with_context(|| format!("failed to load document `{name}`"))?;
            if let Some(state) = stored {
                engine
                    .apply_update(&state, &UpdateOrigin::Persistence)
                    .with_context(|| format!("stored state of `{name}` does not apply"))?;
            }
        }
        info!(doc = name, gc_enabled = self.gc_enabled, "document opened");
        Ok(Arc::new(SharedDocument {
            name: name.to_owned(),
            state: tokio::sync::Mutex::new(DocumentState {
                name: name.to_owned(),
                engine,
                sessions: HashMap::new(),
                persistence: self.persistence.clone(),
                evicted: false,
            }),
        }))
    }

    /// Attaches `session` through socket `connection`. Awareness clients the
    /// session already controls here carry over to the new connection, so a
    /// later detach still announces them as gone.
    pub async fn attach(
        &self,
        name: &str,
        session: &Arc<Session>,
        connection: u64,
        wire_name: Option<String>,
    ) -> Result<Arc<SharedDocument>> {
        loop {
            let doc = self.get_or_create(name).await?;
            let mut state = doc.lock().await;
            if state.evicted {
                // Lost a race with eviction; the map already points elsewhere.
                continue;
            }
            let controlled = state
                .sessions
                .remove(&session.id())
                .map(|previous| previous.controlled)
                .unwrap_or_default();
            state.sessions.insert(
                session.id(),
                Attachment {
                    session: Arc::downgrade(session),
                    connection,
                    wire_name: wire_name.clone(),
                    controlled,
                },
            );
            debug!(doc = name, session_id = %session.id(), sessions = state.sessions.len(), "session attached");
            drop(state);
            return Ok(doc);
        }
    }

    /// Removes the session, announces its awareness clients as gone, and
    /// evicts the document once nobody is left.
    pub async fn detach(
        &self,
        doc: &Arc<SharedDocument>,
        session_id: SessionId,
        connection: u64,
    ) -> DetachOutcome {
        let mut state = doc.lock().await;
        let attached = state
            .sessions
            .get(&session_id)
            .is_some_and(|attachment| attachment.connection == connection);
        if !attached {
            return DetachOutcome::NotAttached;
        }
        let Some(attachment) = state.sessions.remove(&session_id) else {
            return DetachOutcome::NotAttached;
        };

        let controlled: Vec<u64> = attachment.controlled.into_iter().collect();
        match state.engine.remove_awareness_states(&controlled) {
            Ok(Some(update)) => {
                state.broadcast(&Message::Awareness(update), None);
            }
            Ok(None) => {}
            Err(err) => warn!(doc = doc.name(), session_id = %session_id, error = %err, "failed to encode awareness removal"),
        }
        debug!(doc = doc.name(), session_id = %session_id, sessions = state.sessions.len(), "session detached");

        if !state.sessions.is_empty() {
            return DetachOutcome::Retained;
        }
        let Some(persistence) = self.persistence.clone() else {
            self.evict(doc, &mut state);
            return DetachOutcome::Evicted;
        };

        let snapshot = state.engine.encode_state();
        drop(state);
        if let Err(err) = persistence.write_state(doc.name(), snapshot).await {
            error!(doc = doc.name(), error = ?err, "failed to flush document, keeping it in memory");
            return DetachOutcome::Retained;
        }

        let mut state = doc.lock().await;
        if state.sessions.is_empty() && !state.evicted {
            self.evict(doc, &mut state);
            DetachOutcome::Evicted
        } else {
            DetachOutcome::Retained
        }
    }

    fn evict(&self, doc: &Arc<SharedDocument>, state: &mut DocumentState) {
        state.evicted = true;
        let mut docs = self.docs();
        let current = docs
            .get(doc.name())
            .and_then(|cell| cell.get())
            .is_some_and(|live| Arc::ptr_eq(live, doc));
        if current {
            docs.remove(doc.name());
        }
        info!(doc = doc.name(), "document evicted");
    }

    /// Flushes every live document. Returns how many were written.
    pub async fn shutdown(&self) -> usize {
        let Some(persistence) = self.persistence.clone() else {
            return 0;
        };
        let docs: Vec<Arc<SharedDocument>> =
            self.docs().values().filter_map(|cell| cell.get().cloned()).collect();

        let mut flushed = 0;
        for doc in docs {
            let snapshot = doc.lock().await.engine.encode_state();
            match persistence.write_state(doc.name(), snapshot).await {
                Ok(()) => flushed += 1,
                Err(err) => error!(doc = doc.name(), error = ?err, "failed to flush document on shutdown"),
            }
        }
        info!(flushed, "registry flushed");
        flushed
    }

    pub fn document_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .docs()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.docs().get(name).is_some_and(|cell| cell.initialized())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use wikisync_common::protocol::{decode_envelope, SyncMessage};
    use wikisync_common::settings::HeartbeatSettings;
    use wikisync_common::types::now_millis;
    use yrs::{GetString, Text, Transact};

    use super::*;
    use crate::session::Outbound;
    use crate::sync::persistence::MemoryPersistence;

    fn connected_session() -> (Arc<Session>, u64, mpsc::UnboundedReceiver<Outbound>) {
        let session = Arc::new(Session::new(
            SessionId::new(),
            "wiki",
            "key",
            None,
            false,
            now_millis() + 60_000,
            HeartbeatSettings::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = session.bind_transport(tx);
        (session, connection, rx)
    }

    fn messages(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(bytes)) = rx.try_recv() {
            out.push(decode_envelope(&bytes).expect("frame").message().expect("message"));
        }
        out
    }

    fn text_update(content: &str) -> Vec<u8> {
        let engine = YrsEngine::with_client_id(77);
        let text = engine.doc().get_or_insert_text("body");
        engine.transact_local(|txn| text.insert(txn, 0, content))
    }

    fn body(state: &DocumentState) -> String {
        let text = state.engine().doc().get_or_insert_text("body");
        let txn = state.engine().doc().transact();
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_instance() {
        let registry = Arc::new(Registry::in_memory());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("wiki").await })
            })
            .collect();

        let mut docs = Vec::new();
        for handle in handles {
            docs.push(handle.await.expect("task").expect("document"));
        }
        assert!(docs.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.document_names(), vec!["wiki".to_string()]);
    }

    #[tokio::test]
    async fn last_detach_evicts_without_persistence() {
        let registry = Registry::in_memory();
        let (session, connection, _rx) = connected_session();
        let doc = registry.attach("wiki", &session, connection, None).await.expect("attach");

        assert_eq!(registry.detach(&doc, session.id(), connection).await, DetachOutcome::Evicted);
        assert!(!registry.contains("wiki"));
        assert_eq!(registry.detach(&doc, session.id(), connection).await, DetachOutcome::NotAttached);

        let fresh = registry.get_or_create("wiki").await.expect("recreate");
        assert!(!Arc::ptr_eq(&doc, &fresh));
    }

    #[tokio::test]
    async fn stale_connection_does_not_detach_newer_one() {
        let registry = Registry::in_memory();
        let (session, first, _rx) = connected_session();
        registry.attach("wiki", &session, first, None).await.expect("attach");
        let (tx, _rx2) = mpsc::unbounded_channel();
        let second = session.bind_transport(tx);
        let doc = registry.attach("wiki", &session, second, None).await.expect("reattach");

        assert_eq!(registry.detach(&doc, session.id(), first).await, DetachOutcome::NotAttached);
        assert!(doc.lock().await.is_attached(session.id()));
    }

    #[tokio::test]
    async fn detach_removes_controlled_awareness_and_tells_others() {
        let registry = Registry::in_memory();
        let (alice, alice_conn, _alice_rx) = connected_session();
        let (bob, bob_conn, mut bob_rx) = connected_session();
        let doc = registry.attach("wiki", &alice, alice_conn, None).await.expect("attach alice");
        registry.attach("wiki", &bob, bob_conn, None).await.expect("attach bob");

        let peer = YrsEngine::with_client_id(42);
        let update = peer.set_local_awareness(&json!({ "user": "alice" })).expect("presence");
        {
            let mut state = doc.lock().await;
            let change = state
                .engine()
                .apply_awareness_update(&update, &UpdateOrigin::Session(alice.id()))
                .expect("awareness applies");
            state.track_awareness(alice.id(), &change);
            assert_eq!(state.controlled_clients(alice.id()), vec![42]);
        }

        assert_eq!(registry.detach(&doc, alice.id(), alice_conn).await, DetachOutcome::Retained);

        let received = messages(&mut bob_rx);
        let [Message::Awareness(removal)] = received.as_slice() else {
            panic!("expected one awareness removal, got {received:?}");
        };
        let observer = YrsEngine::with_client_id(7);
        observer.apply_awareness_update(&update, &UpdateOrigin::Local).expect("presence");
        let change = observer.apply_awareness_update(removal, &UpdateOrigin::Local).expect("removal");
        assert_eq!(change.removed, vec![42]);
        assert!(doc.lock().await.engine().awareness_client_ids().is_empty());
    }

    #[tokio::test]
    async fn reattach_on_new_connection_keeps_controlled_awareness() {
        let registry = Registry::in_memory();
        let (alice, first, _first_rx) = connected_session();
        let (bob, bob_conn, mut bob_rx) = connected_session();
        let doc = registry.attach("wiki", &alice, first, None).await.expect("attach alice");
        registry.attach("wiki", &bob, bob_conn, None).await.expect("attach bob");

        let peer = YrsEngine::with_client_id(42);
        let update = peer.set_local_awareness(&json!({ "user": "alice" })).expect("presence");
        {
            let mut state = doc.lock().await;
            let change = state
                .engine()
                .apply_awareness_update(&update, &UpdateOrigin::Session(alice.id()))
                .expect("awareness applies");
            state.track_awareness(alice.id(), &change);
        }

        let (tx, _second_rx) = mpsc::unbounded_channel();
        let second = alice.bind_transport(tx);
        registry.attach("wiki", &alice, second, None).await.expect("reattach");
        assert_eq!(registry.detach(&doc, alice.id(), first).await, DetachOutcome::NotAttached);
        assert_eq!(doc.lock().await.controlled_clients(alice.id()), vec![42]);
        assert!(messages(&mut bob_rx).is_empty());

        assert_eq!(registry.detach(&doc, alice.id(), second).await, DetachOutcome::Retained);
        let received = messages(&mut bob_rx);
        assert!(
            matches!(received.as_slice(), [Message::Awareness(_)]),
            "expected one awareness removal, got {received:?}"
        );
        assert!(doc.lock().await.engine().awareness_client_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_load_leaves_nothing_registered() {
        let persistence = Arc::new(MemoryPersistence::with_state("wiki", vec![0xff, 0xff]));
        let registry = Registry::new(Some(persistence as Arc<dyn PersistenceProvider>), true);

        assert!(registry.get_or_create("wiki").await.is_err());
        assert!(!registry.contains("wiki"));
        assert!(registry.document_names().is_empty());
        assert!(registry.docs().is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_origin_and_uses_recipient_wire_name() {
        let registry = Registry::in_memory();
        let (alice, alice_conn, mut alice_rx) = connected_session();
        let (bob, bob_conn, mut bob_rx) = connected_session();
        let doc = registry.attach("wiki", &alice, alice_conn, None).await.expect("attach");
        registry.attach("wiki", &bob, bob_conn, Some("wiki".into())).await.expect("attach");

        let message = Message::Sync(SyncMessage::Update(text_update("hi")));
        assert_eq!(doc.lock().await.broadcast(&message, Some(alice.id())), 1);

        assert!(messages(&mut alice_rx).is_empty());
        let Ok(Outbound::Frame(bytes)) = bob_rx.try_recv() else {
            panic!("bob should receive a frame");
        };
        assert_eq!(decode_envelope(&bytes).expect("frame").doc_name.as_deref(), Some("wiki"));
    }

    #[tokio::test]
    async fn persistence_binds_before_use_and_flushes_on_last_detach() {
        let stored = text_update("from disk");
        let persistence = Arc::new(MemoryPersistence::with_state("wiki", stored));
        let registry = Registry::new(Some(persistence.clone() as Arc<dyn PersistenceProvider>), true);
        let (session, connection, _rx) = connected_session();

        let doc = registry.attach("wiki", &session, connection, None).await.expect("attach");
        assert_eq!(body(&*doc.lock().await), "from disk");

        let update = {
            let engine = YrsEngine::with_client_id(5);
            engine.apply_update(&doc.lock().await.engine().encode_state(), &UpdateOrigin::Local).expect("sync");
            let text = engine.doc().get_or_insert_text("body");
            engine.transact_local(|txn| text.insert(txn, 0, ">> "))
        };
        doc.lock()
            .await
            .apply_update(&update, &UpdateOrigin::Session(session.id()))
            .expect("update applies");
        assert_eq!(persistence.updates("wiki").len(), 1);

        assert_eq!(registry.detach(&doc, session.id(), connection).await, DetachOutcome::Evicted);
        assert_eq!(persistence.writes(), 1);

        let reloaded = registry.get_or_create("wiki").await.expect("reload");
        assert_eq!(body(&*reloaded.lock().await), ">> from disk");
    }

    #[tokio::test]
    async fn invalid_update_is_not_persisted() {
        let persistence = Arc::new(MemoryPersistence::new());
        let registry = Registry::new(Some(persistence.clone() as Arc<dyn PersistenceProvider>), true);
        let doc = registry.get_or_create("wiki").await.expect("create");

        let result = doc.lock().await.apply_update(&[0xff, 0xff], &UpdateOrigin::Local);
        assert!(result.is_err());
        assert!(persistence.updates("wiki").is_empty());
    }

    #[tokio::test]
    async fn shutdown_flushes_every_document() {
        let persistence = Arc::new(MemoryPersistence::new());
        let registry = Registry::new(Some(persistence.clone() as Arc<dyn PersistenceProvider>), false);
        registry.get_or_create("wiki").await.expect("create");
        registry.get_or_create("wiki/a").await.expect("create");

        assert_eq!(registry.shutdown().await, 2);
        assert!(persistence.state("wiki/a").is_some());
    }

    #[tokio::test]
    async fn attach_after_eviction_gets_fresh_document() {
        let registry = Arc::new(Registry::in_memory());
        let (alice, alice_conn, _a) = connected_session();
        let (bob, bob_conn, _b) = connected_session();
        let doc = registry.attach("wiki", &alice, alice_conn, None).await.expect("attach");

        let detach = {
            let registry = Arc::clone(&registry);
            let doc = Arc::clone(&doc);
            let id = alice.id();
            tokio::spawn(async move { registry.detach(&doc, id, alice_conn).await })
        };
        let attached = registry.attach("wiki", &bob, bob_conn, None).await.expect("attach");
        detach.await.expect("detach task");
        tokio::time::timeout(Duration::from_secs(1), async {
            assert!(attached.lock().await.is_attached(bob.id()));
        })
        .await
        .expect("no deadlock");
        assert!(registry.contains("wiki"));
    }
}
