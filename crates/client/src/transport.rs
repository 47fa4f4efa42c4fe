// Relay socket driver: opens the connection, pumps frames through the
// session and reopens it with backoff after abnormal closes.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use wikisync_common::types::CLOSE_ABNORMAL;

use crate::config::{ClientConfig, ConfigError};
use crate::dispatch::{handle_frame, FrameOutcome};
use crate::reconnect::ReconnectDecision;
use crate::session::{ClientSession, Outbound};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close frame without a status code.
const CLOSE_NO_STATUS: u16 = 1005;

/// Where and how to open the relay socket.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub url: Url,
    /// `Authorization` header sent with the upgrade request.
    pub authorization: Option<String>,
}

impl ConnectTarget {
    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        Ok(Self { url: config.ws_url()?, authorization: config.authorization() })
    }
}

/// A running connection loop for one session.
pub struct ClientHandle {
    session: Arc<ClientSession>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Closes the socket normally and waits for the loop to exit.
    pub async fn shutdown(self) {
        self.session.disconnect();
        if let Err(err) = self.task.await {
            warn!(session_id = %self.session.id(), error = %err, "client task failed");
        }
    }
}

/// Connects `session` to the relay and keeps it connected until it is
/// disconnected or gives up.
pub fn spawn(target: ConnectTarget, session: Arc<ClientSession>) -> ClientHandle {
    session.connect();
    let task = tokio::spawn(run(target, Arc::clone(&session)));
    ClientHandle { session, task }
}

async fn run(target: ConnectTarget, session: Arc<ClientSession>) {
    while session.begin_connect() {
        let (code, reason) = match open(&target).await {
            Ok(socket) => {
                let (outbound, queue) = mpsc::unbounded_channel();
                session.on_open(outbound);
                drive(&session, socket, queue).await
            }
            Err(err) => {
                warn!(session_id = %session.id(), url = %target.url, error = %err, "relay connection failed");
                (CLOSE_ABNORMAL, format!("{err:#}"))
            }
        };

        match session.on_close(code, &reason) {
            ReconnectDecision::Retry(delay) => {
                info!(session_id = %session.id(), delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = session.stopped() => {}
                }
            }
            ReconnectDecision::Stop | ReconnectDecision::GiveUp => break,
        }
    }
    debug!(session_id = %session.id(), "client loop stopped");
}

async fn open(target: &ConnectTarget) -> Result<Socket> {
    let mut request = target
        .url
        .as_str()
        .into_client_request()
        .context("failed to build upgrade request")?;
    if let Some(authorization) = &target.authorization {
        let value = HeaderValue::from_str(authorization).context("invalid authorization header")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (socket, _response) = connect_async(request).await.context("websocket upgrade failed")?;
    Ok(socket)
}

/// Runs one open socket until it closes. Returns the close code and reason.
async fn drive(
    session: &Arc<ClientSession>,
    socket: Socket,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) -> (u16, String) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            biased;

            outbound = queue.recv() => match outbound {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(err) = sink.send(WsMessage::Binary(bytes.into())).await {
                        return (CLOSE_ABNORMAL, err.to_string());
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.clone().into() };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    return (code, reason);
                }
                None => return (CLOSE_ABNORMAL, "session released the socket".into()),
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if let FrameOutcome::Closed(err) = handle_frame(session, &bytes) {
                        debug!(session_id = %session.id(), error = %err, "closing after frame");
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    return match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                }
                Some(Ok(WsMessage::Text(_))) => {
                    debug!(session_id = %session.id(), "ignoring text frame");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return (CLOSE_ABNORMAL, err.to_string()),
                None => return (CLOSE_ABNORMAL, "connection dropped".into()),
            },
        }
    }
}
