//! Streaming WebSocket handler
//!
//! The upgrade has already been authenticated by `session_auth_middleware`
//! and counted by `connection_limit_middleware`. This module owns the socket:
//! a writer task drains an mpsc channel into the sink half, and the reader
//! loop feeds frames and timer expiry into a [`StreamConnection`].

use axum::{
    Extension,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::middleware::{ClientIp, ConnectionSlot, StreamAuth};
use crate::state::AppState;

use super::messages::MessageRoute;
use super::state::{Flow, Shutdown, StreamConnection};

/// Channel buffer between the reader loop and the writer task
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Maximum WebSocket frame size (1 MB)
const MAX_WS_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum WebSocket message size (4 MB)
const MAX_WS_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// How long queued replies and the close frame may take to drain
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Streaming WebSocket handler
///
/// Upgrades the HTTP connection for the session named by the bearer token.
/// The connection slot reserved by the limit middleware travels with the
/// socket task and is released when it ends.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<StreamAuth>,
    slot: Option<Extension<ConnectionSlot>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    info!(
        session_id = %auth.session_id(),
        client_ip = ?client_ip.map(|Extension(ClientIp(ip))| ip),
        "Stream connection upgrade requested"
    );

    let slot = slot.map(|Extension(slot)| slot);
    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            handle_stream_socket(socket, state, auth).await;
            drop(slot);
        })
}

async fn handle_stream_socket(socket: WebSocket, app: Arc<AppState>, auth: StreamAuth) {
    let session_id = auth.session_id().to_string();
    info!(session_id = %session_id, "Stream connection established");

    let (mut sender, mut receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);

    // Writer task for outgoing messages
    let sender_task = tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            let should_close = matches!(route, MessageRoute::Close { .. });

            let result = match route {
                MessageRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                },
                MessageRoute::Close { code, reason } => {
                    debug!(code, reason = %reason, "Sending close frame");
                    sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await
                }
            };

            if let Err(e) = result {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }

            if should_close {
                break;
            }
        }
    });

    // Cancelled when the session terminates from anywhere
    let session_closed = app
        .sessions
        .closed_token(&session_id)
        .unwrap_or_else(|| {
            let token = CancellationToken::new();
            token.cancel();
            token
        });

    let mut conn = StreamConnection::new(app.clone(), session_id.clone(), message_tx.clone());

    let shutdown = loop {
        let deadline = conn.next_deadline();

        let flow = select! {
            biased;

            _ = session_closed.cancelled() => {
                let reason = app
                    .sessions
                    .get(&session_id)
                    .and_then(|session| session.termination_reason);
                info!(session_id = %session_id, reason = ?reason, "Session ended, closing stream");
                Flow::Close(Shutdown::session_ended(reason))
            }
            _ = app.shutdown.cancelled() => {
                Flow::Close(Shutdown::going_away(conn.disconnect_reason()))
            }
            msg_result = receiver.next() => match msg_result {
                Some(Ok(Message::Text(text))) => conn.on_text(text.as_str()).await,
                Some(Ok(Message::Binary(data))) => conn.on_binary(data.len()).await,
                // Control frames are answered by the transport
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Flow::Continue,
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        session_id = %session_id,
                        code = frame.as_ref().map(|f| f.code),
                        "Stream closed by client"
                    );
                    Flow::Close(Shutdown::disconnected(conn.disconnect_reason()))
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "Stream WebSocket error: {}", e);
                    Flow::Close(Shutdown::disconnected(conn.disconnect_reason()))
                }
                None => {
                    info!(session_id = %session_id, "Stream connection dropped");
                    Flow::Close(Shutdown::disconnected(conn.disconnect_reason()))
                }
            },
            _ = sleep_until(deadline) => conn.on_deadline().await,
        };

        if let Flow::Close(shutdown) = flow {
            break shutdown;
        }
    };

    // Session state settles before the peer sees the close frame
    conn.finish(shutdown.termination).await;
    drop(conn);

    if shutdown.send_close {
        let _ = message_tx
            .send(MessageRoute::Close {
                code: shutdown.code,
                reason: shutdown.reason.clone(),
            })
            .await;
    }
    drop(message_tx);

    let abort = sender_task.abort_handle();
    if time::timeout(WRITER_DRAIN_TIMEOUT, sender_task).await.is_err() {
        warn!(session_id = %session_id, "Writer task did not drain in time");
        abort.abort();
    }

    info!(
        session_id = %session_id,
        code = shutdown.code,
        reason = %shutdown.reason,
        "Stream connection closed"
    );
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
