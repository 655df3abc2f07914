//! WebSocket transport for real-time sessions.

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, Extension, Query,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use solace_conversations::EndReason;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::session::{ConnectionHandler, Flow, ServerMessage};
use crate::AppState;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Bearer token. Browsers cannot set headers on WebSocket requests.
    pub token: Option<String>,
}

/// Handler for `GET /ws`.
///
/// The credential is checked before the upgrade; a rejected connection never
/// gets a session.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    let header_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(token) = params.token.or(header_token) else {
        tracing::warn!(remote_addr = %addr, "websocket connect missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if let Err(e) = state.tokens.verify_token(&token) {
        tracing::warn!(remote_addr = %addr, "websocket token verification failed: {}", e);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, token, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: String, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(256);

    let mut conn = ConnectionHandler::new(state.sessions.clone(), tx);
    if let Err(e) = conn.authenticate(&token) {
        tracing::warn!(remote_addr = %addr, "websocket session authentication failed: {}", e);
        let _ = sender.send(AxumMessage::Close(None)).await;
        return;
    }
    tracing::debug!(
        remote_addr = %addr,
        user_id = conn.user_id().unwrap_or_default(),
        "websocket connected"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("failed to serialize session message: {}", e);
                    continue;
                }
            };
            if sender.send(AxumMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(AxumMessage::Close(None)).await;
    });

    let mut shutdown = state.sessions.shutdown_signal();
    let mut shutting_down = *shutdown.borrow();
    let mut watch_open = true;
    while !shutting_down {
        tokio::select! {
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    AxumMessage::Text(text) => {
                        if conn.handle_frame(text.as_str()).await == Flow::Close {
                            break;
                        }
                    }
                    AxumMessage::Close(_) => break,
                    _ => {}
                }
            }
            changed = shutdown.changed(), if watch_open => {
                match changed {
                    Ok(()) => shutting_down = *shutdown.borrow(),
                    Err(_) => watch_open = false,
                }
            }
        }
    }

    if shutting_down {
        if let Some(ended) = conn.finish(EndReason::Shutdown).await {
            conn.send(ended).await;
        }
    } else {
        // No-op when the client already sent `end`.
        conn.disconnect().await;
    }

    // Dropping the handler closes the outbound channel once in-flight turns
    // release their clones, which lets the send task finish.
    drop(conn);
    if tokio::time::timeout(std::time::Duration::from_secs(5), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    tracing::debug!(remote_addr = %addr, "websocket disconnected");
}
