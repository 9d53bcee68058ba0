use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_core::frame::kind;
use relay_core::{Frame, FrameCodec, UserId};

use crate::registry::{ConnectionHandle, ControlMsg, Registry};

/// Run one admitted connection to completion: writer and reader tasks joined
/// by a select, then removal from the registry. Mirrors the reader/writer
/// split used for every socket in this codebase.
pub async fn serve_connection(
    socket: WebSocket,
    conn: Arc<ConnectionHandle>,
    mut data_rx: mpsc::Receiver<String>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    registry: Arc<Registry>,
    inbound_tx: mpsc::Sender<(UserId, Frame)>,
    cancel: CancellationToken,
) {
    let codec = *registry.codec();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: data frames, heartbeat pings, and close requests.
    let writer = tokio::spawn(async move {
        loop {
            // Data first so queued frames go out before a close request.
            tokio::select! {
                biased;
                msg = data_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                ctrl = control_rx.recv() => {
                    match ctrl {
                        Some(ControlMsg::Ping) => {
                            if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                                break;
                            }
                        }
                        Some(ControlMsg::Close { code, reason }) => {
                            let _ = ws_tx
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = ws_tx
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "going away".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader: decode, dispatch control frames, forward the rest inbound.
    let reader_conn = Arc::clone(&conn);
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_text(&codec, &reader_conn, &reader_registry, &inbound_tx, text.as_str())
                        .await;
                }
                WsMessage::Pong(_) => reader_conn.record_pong(),
                WsMessage::Close(_) => break,
                // axum answers protocol pings automatically.
                WsMessage::Ping(_) => {}
                // Binary frames are not part of the protocol; ignored.
                WsMessage::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.remove(&conn.user, &conn.id);
    tracing::info!(connection_id = %conn.id, user = %conn.user, "connection closed");
}

async fn handle_text(
    codec: &FrameCodec,
    conn: &Arc<ConnectionHandle>,
    registry: &Arc<Registry>,
    inbound_tx: &mpsc::Sender<(UserId, Frame)>,
    text: &str,
) {
    let frame = match codec.decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(connection_id = %conn.id, error = %e, "undecodable frame");
            if let Ok(wire) = codec.encode(&Frame::error("Invalid message format")) {
                conn.send_text(wire);
            }
            return;
        }
    };

    match frame.kind.as_str() {
        kind::PING => {
            if let Ok(wire) = codec.encode(&Frame::pong()) {
                conn.send_text(wire);
            }
        }
        kind::PONG => conn.record_pong(),
        kind::AUTH => {
            let is_authenticated = frame
                .field("isAuthenticated")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            registry.record_auth(&conn.user, &conn.id, is_authenticated);
        }
        _ => {
            // Task-engine traffic. Sent outside any registry lock; a full or
            // closed engine channel never tears down the connection.
            if inbound_tx.send((conn.user.clone(), frame)).await.is_err() {
                tracing::debug!(connection_id = %conn.id, "inbound channel closed, frame dropped");
            }
        }
    }
}

/// Refusal path for upgrades that carry no resolvable user identity: a brief
/// error frame, then close 4001.
pub async fn refuse_missing_user(mut socket: WebSocket, codec: &FrameCodec) {
    if let Ok(wire) = codec.encode(&Frame::error("Missing user")) {
        let _ = socket.send(WsMessage::Text(wire.into())).await;
    }
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code: 4001,
            reason: "missing user".into(),
        })))
        .await;
}
