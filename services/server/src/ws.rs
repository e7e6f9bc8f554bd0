//! The websocket surface: the token endpoint, the device endpoint, and
//! the server-side channel over an accepted socket.
//!
//! Handshake: the device fetches a one-minute token over authenticated
//! HTTP, then dials the websocket with the token in the query string. The
//! token binds device id and client host; a mismatch closes the socket
//! with protocol code 4003 before any message flows.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meridian_edge::DeviceId;
use meridian_edge::channel::{ChannelError, EdgeChannel, decode_frame};
use meridian_edge::messages::EdgeMessage;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::data::DataError;
use crate::error::ApiError;
use crate::handler::build_device_handler;
use crate::repo::devices::{ensure_device_exists, set_device_seen};
use crate::state::AppState;

/// Close code for a failed token check.
const CLOSE_INVALID_TOKEN: u16 = 4003;
/// Close code for a device id the server does not know.
const CLOSE_UNKNOWN_DEVICE: u16 = 4004;

// ---------------------------------------------------------------------------
// Server-side channel
// ---------------------------------------------------------------------------

/// [`EdgeChannel`] over an accepted axum websocket.
pub struct ServerWebsocketChannel {
    write: Mutex<SplitSink<WebSocket, Message>>,
    read: Mutex<SplitStream<WebSocket>>,
    connected: AtomicBool,
}

impl ServerWebsocketChannel {
    pub fn new(socket: WebSocket) -> Self {
        let (write, read) = socket.split();
        ServerWebsocketChannel {
            write: Mutex::new(write),
            read: Mutex::new(read),
            connected: AtomicBool::new(true),
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl EdgeChannel for ServerWebsocketChannel {
    async fn send(&self, message: &EdgeMessage) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(message.encode()))
            .await
            .map_err(|_| {
                self.mark_disconnected();
                ChannelError::Disconnected
            })
    }

    async fn receive(&self) -> Result<EdgeMessage, ChannelError> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                None => {
                    self.mark_disconnected();
                    return Err(ChannelError::Disconnected);
                }
                Some(Err(_)) => {
                    self.mark_disconnected();
                    return Err(ChannelError::Disconnected);
                }
                Some(Ok(Message::Text(frame))) => {
                    if let Some(message) = decode_frame(&frame) {
                        return Ok(message);
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    self.mark_disconnected();
                    return Err(ChannelError::Disconnected);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let mut write = self.write.lock().await;
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// The socket was accepted by the HTTP layer; there is nothing left to
    /// connect.
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ChannelError::ConnectFailed(
                "a server-side channel cannot be reconnected".to_owned(),
            ))
        }
    }

    async fn disconnect(&self) {
        let mut write = self.write.lock().await;
        let _ = write.send(Message::Close(None)).await;
        self.mark_disconnected();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

/// `GET /devices/{device_id}/ws/token` — bearer-authenticated; returns a
/// short-lived connection token bound to the caller's address.
pub async fn get_ws_token(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(crate::auth::extract_bearer)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_owned()))?;
    if !state.verifier.verify(bearer) {
        return Err(ApiError::Unauthorized("invalid API token".to_owned()));
    }

    ensure_device_exists(&state.pool, device_id).await?;

    state
        .tokens
        .issue(device_id, &addr.ip().to_string())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

// ---------------------------------------------------------------------------
// Websocket endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

/// `GET /devices/{device_id}/ws?token=…` — the device link itself.
pub async fn device_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let hostname = addr.ip().to_string();
    ws.on_upgrade(move |socket| {
        handle_device_socket(socket, state, device_id, query.token, hostname)
    })
    .into_response()
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_device_socket(
    socket: WebSocket,
    state: AppState,
    device_id: DeviceId,
    token: String,
    hostname: String,
) {
    match ensure_device_exists(&state.pool, device_id).await {
        Ok(()) => {}
        Err(DataError::NotFound(_)) => {
            close_with(socket, CLOSE_UNKNOWN_DEVICE, "Unknown device.").await;
            return;
        }
        Err(err) => {
            warn!(device_id = %device_id, error = %err, "device lookup failed");
            close_with(socket, CLOSE_UNKNOWN_DEVICE, "Unknown device.").await;
            return;
        }
    }

    if let Err(err) = state.tokens.verify(&token, device_id, &hostname) {
        info!(device_id = %device_id, error = %err, "rejected websocket token");
        close_with(socket, CLOSE_INVALID_TOKEN, "Invalid token.").await;
        return;
    }

    if let Err(err) = set_device_seen(&state.pool, device_id).await {
        warn!(device_id = %device_id, error = %err, "failed to mark device as seen");
    }

    let channel = Arc::new(ServerWebsocketChannel::new(socket));
    if let Err(err) = state
        .connections
        .add(device_id, Arc::clone(&channel))
        .await
    {
        warn!(device_id = %device_id, error = %err, "failed to register device connection");
        state.connections.remove(device_id).await;
        return;
    }

    let handler = build_device_handler(state.pool.clone(), device_id, channel);
    if let Err(err) = handler.listen().await {
        info!(device_id = %device_id, error = %err, "device connection closed");
    }
    state.connections.remove(device_id).await;
}
