use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};
use wikisync_client::{spawn, ClientConfig, ClientHandle, ClientSession, ConnectTarget, SessionEvent};
use wikisync_common::settings::{HeartbeatSettings, ReconnectSettings, SessionSettings};
use wikisync_common::types::CLOSE_HEARTBEAT_TIMEOUT;
use wikisync_common::{ConnectionState, SessionId};
use wikisync_relay::auth::BasicAuthGate;
use wikisync_relay::session::{OpenSession, SessionStore};
use wikisync_relay::sync::Registry;
use wikisync_relay::{build_router, RelayState};
use yrs::{GetString, Text, Transact};

const KEY: &str = "client-integration-key";

struct Relay {
    addr: std::net::SocketAddr,
    state: RelayState,
    task: tokio::task::JoinHandle<()>,
}

impl Relay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let state = RelayState::from_parts(
            Arc::new(SessionStore::new(HeartbeatSettings::default())),
            Arc::new(Registry::in_memory()),
            Arc::new(BasicAuthGate::open()),
            KEY,
            Duration::from_secs(600),
            1 << 20,
        );
        let app = build_router(state.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("relay should serve");
        });
        Self { addr, state, task }
    }

    async fn provision(&self) -> SessionId {
        self.state
            .sessions
            .open_session(OpenSession {
                id: None,
                room: "wiki".into(),
                key: KEY.into(),
                username: None,
                read_only: false,
                ttl: Duration::from_secs(600),
            })
            .await
            .id()
    }

    fn config(&self, session_id: SessionId) -> ClientConfig {
        ClientConfig {
            relay_url: format!("http://{}", self.addr),
            session_id: Some(session_id),
            key: KEY.into(),
            session: SessionSettings {
                heartbeat: HeartbeatSettings::default(),
                reconnect: ReconnectSettings {
                    base_delay_ms: 20,
                    max_delay_ms: 100,
                    max_retries: 2,
                    ..ReconnectSettings::default()
                },
            },
            ..ClientConfig::default()
        }
    }

    /// Subscribes before spawning so no early event is missed.
    fn connect(&self, config: &ClientConfig) -> (ClientHandle, broadcast::Receiver<SessionEvent>) {
        let session = Arc::new(ClientSession::from_config(config).expect("session id configured"));
        let events = session.subscribe();
        let target = ConnectTarget::from_config(config).expect("relay url is valid");
        (spawn(target, session), events)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn wait_for(events: &mut broadcast::Receiver<SessionEvent>, wanted: SessionEvent) {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

async fn wait_for_text(session: &ClientSession, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if body_text(session) == expected {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for text {expected:?}, have {:?}", body_text(session));
        sleep(Duration::from_millis(10)).await;
    }
}

fn body_text(session: &ClientSession) -> String {
    let engine = session.default_doc();
    let body = engine.doc().get_or_insert_text("body");
    let txn = engine.doc().transact();
    body.get_string(&txn)
}

fn edit(session: &ClientSession, text: &str) {
    let engine = session.default_doc();
    let body = engine.doc().get_or_insert_text("body");
    let len = body.get_string(&engine.doc().transact()).len() as u32;
    session.transact(session.room(), |txn| body.insert(txn, len, text)).expect("edit applies");
}

#[tokio::test]
async fn two_clients_converge_through_the_relay() {
    let relay = Relay::start().await;
    let (alice, mut alice_events) = relay.connect(&relay.config(relay.provision().await));
    let (bob, mut bob_events) = relay.connect(&relay.config(relay.provision().await));

    wait_for(&mut alice_events, SessionEvent::Synced(true)).await;
    wait_for(&mut bob_events, SessionEvent::Synced(true)).await;
    assert_eq!(alice.session().connection_state(), ConnectionState::Synced);

    edit(alice.session(), "hello");
    wait_for_text(bob.session(), "hello").await;
    edit(bob.session(), " world");
    wait_for_text(alice.session(), "hello world").await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn offline_edits_reach_the_relay_after_reconnect() {
    let relay = Relay::start().await;
    let alice_id = relay.provision().await;
    let (alice, mut alice_events) = relay.connect(&relay.config(alice_id));
    let (bob, mut bob_events) = relay.connect(&relay.config(relay.provision().await));
    wait_for(&mut alice_events, SessionEvent::Synced(true)).await;
    wait_for(&mut bob_events, SessionEvent::Synced(true)).await;

    let server_side = relay.state.sessions.get(alice_id).await.expect("alice is known to the relay");
    server_side.force_close(CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat Timeout");
    wait_for(
        &mut alice_events,
        SessionEvent::Closed { code: CLOSE_HEARTBEAT_TIMEOUT, reason: "Heartbeat Timeout".into() },
    )
    .await;

    // Made while disconnected; carried by the resync.
    edit(alice.session(), "written offline");
    wait_for(&mut alice_events, SessionEvent::Synced(true)).await;
    wait_for_text(bob.session(), "written offline").await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn unknown_session_gives_up_after_retry_budget() {
    let relay = Relay::start().await;
    let (handle, mut events) = relay.connect(&relay.config(SessionId::new()));

    wait_for(&mut events, SessionEvent::Desynced).await;
    timeout(Duration::from_secs(5), async {
        while !handle.is_finished() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client loop should stop after giving up");
    assert!(!handle.session().should_connect());
}

#[tokio::test]
async fn shutdown_closes_the_relay_side_session() {
    let relay = Relay::start().await;
    let id = relay.provision().await;
    let (handle, mut events) = relay.connect(&relay.config(id));
    wait_for(&mut events, SessionEvent::Synced(true)).await;

    handle.shutdown().await;
    let server_side = relay.state.sessions.get(id).await.expect("session is still provisioned");
    let deadline = Instant::now() + Duration::from_secs(5);
    while server_side.is_ready() {
        assert!(Instant::now() < deadline, "relay never saw the close");
        sleep(Duration::from_millis(10)).await;
    }
}
