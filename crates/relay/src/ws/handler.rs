use std::sync::Arc;

use axum::{
    extract::{
        ws::{
            close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket,
            WebSocketUpgrade,
        },
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::dispatch::{Dispatcher, FrameOutcome};
use super::{verify_upgrade, UpgradeParams};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope};
use crate::session::{Outbound, Session};
use crate::RelayState;

pub(super) async fn ws_upgrade(
    State(state): State<RelayState>,
    Query(params): Query<UpgradeParams>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let session = match verify_upgrade(&state, &headers, &params).await {
        Ok(session) => session,
        Err(err) => return err.into_response(),
    };
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id = request_id_from_headers_or_generate(&headers);
    let dispatcher = state.dispatcher.clone();
    let max_frame_bytes = state.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes)
        .max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| {
            with_request_id_scope(request_id, handle_socket(dispatcher, session, socket, max_frame_bytes))
        })
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn handle_socket(
    dispatcher: Dispatcher,
    session: Arc<Session>,
    mut socket: WebSocket,
    max_frame_bytes: usize,
) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
    let mut connection = dispatcher.open(session, outbound_sender);
    let session_id = connection.session().id();

    loop {
        tokio::select! {
            biased;

            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(Outbound::Frame(bytes)) => {
                        if socket.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Binary(bytes)) => {
                        match dispatcher.handle_frame(&mut connection, &bytes).await {
                            FrameOutcome::Handled | FrameOutcome::Dropped(_) => {}
                            // The close frame is already queued.
                            FrameOutcome::Closed(err) => {
                                debug!(session_id = %session_id, error = %err, "closing after frame");
                            }
                        }
                    }
                    Ok(Message::Text(_)) => {
                        debug!(session_id = %session_id, "ignoring text frame");
                    }
                    Ok(Message::Ping(_) | Message::Pong(_)) => {}
                    Ok(Message::Close(frame)) => {
                        debug!(session_id = %session_id, ?frame, "peer closed socket");
                        break;
                    }
                    Err(error) if is_frame_size_violation(&error) => {
                        warn!(session_id = %session_id, max_frame_bytes, "frame exceeds size limit");
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::SIZE,
                                reason: format!("websocket frame exceeds maximum size of {max_frame_bytes} bytes").into(),
                            })))
                            .await;
                        break;
                    }
                    Err(error) => {
                        warn!(session_id = %session_id, error = %error, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    dispatcher.close(connection).await;
}
