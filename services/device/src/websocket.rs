//! Device-side websocket channel.
//!
//! `connect` first fetches a short-lived connection token from the server's
//! HTTP API (authenticated with the bearer token cached in the blackbox)
//! and then dials the websocket endpoint with the token in the query
//! string. One connect attempt per call; the runtime composes this with its
//! backoff policy.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meridian_edge::channel::{ChannelError, EdgeChannel, decode_frame};
use meridian_edge::messages::EdgeMessage;
use meridian_edge::DeviceId;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::storage::blackbox::Blackbox;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Hook invoked after every successful connect. The hook owns whatever
/// handles it needs (typically a clone of the client's `Arc`).
pub type OnConnect =
    Arc<dyn Fn() -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// The device's websocket connection to the server.
pub struct DeviceWebsocketClient {
    settings: ConnectionSettings,
    device_id: DeviceId,
    blackbox: Arc<Mutex<Blackbox>>,
    http: reqwest::Client,
    write: Mutex<Option<SplitSink<WsStream, Message>>>,
    read: Mutex<Option<SplitStream<WsStream>>>,
    connected: AtomicBool,
    on_connect: StdMutex<Option<OnConnect>>,
}

impl DeviceWebsocketClient {
    pub fn new(
        settings: ConnectionSettings,
        device_id: DeviceId,
        blackbox: Arc<Mutex<Blackbox>>,
    ) -> Self {
        DeviceWebsocketClient {
            settings,
            device_id,
            blackbox,
            http: reqwest::Client::new(),
            write: Mutex::new(None),
            read: Mutex::new(None),
            connected: AtomicBool::new(false),
            on_connect: StdMutex::new(None),
        }
    }

    /// Register the hook fired after each successful connect.
    pub fn set_on_connect(&self, hook: OnConnect) {
        *self.on_connect.lock().expect("on_connect mutex") = Some(hook);
    }

    /// Fetch a fresh connection token from the server's HTTP API.
    async fn fetch_connection_token(&self) -> Result<String, ChannelError> {
        let api_token = self
            .blackbox
            .lock()
            .await
            .read_api_token()
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?
            .filter(crate::storage::blackbox::ApiToken::is_valid)
            .ok_or_else(|| {
                ChannelError::ConnectFailed("no valid API token is stored".to_owned())
            })?;

        let response = self
            .http
            .get(self.settings.websocket_token_uri(self.device_id))
            .bearer_auth(&api_token.token)
            .send()
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::ConnectFailed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl EdgeChannel for DeviceWebsocketClient {
    async fn send(&self, message: &EdgeMessage) -> Result<(), ChannelError> {
        let mut guard = self.write.lock().await;
        let sink = guard.as_mut().ok_or(ChannelError::Disconnected)?;
        sink.send(Message::Text(message.encode().into()))
            .await
            .map_err(|err| {
                debug!(error = %err, "websocket send failed");
                self.mark_disconnected();
                ChannelError::Disconnected
            })
    }

    async fn receive(&self) -> Result<EdgeMessage, ChannelError> {
        let mut guard = self.read.lock().await;
        let stream = guard.as_mut().ok_or(ChannelError::Disconnected)?;
        loop {
            match stream.next().await {
                None => {
                    self.mark_disconnected();
                    return Err(ChannelError::Disconnected);
                }
                Some(Err(err)) => {
                    debug!(error = %err, "websocket receive failed");
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
                    if let Some(sink) = write.as_mut() {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Ok(());
        }

        let token = self.fetch_connection_token().await?;
        let uri = self.settings.websocket_uri(self.device_id, Some(&token));

        let (stream, _response) = tokio_tungstenite::connect_async(uri.as_str())
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        let (write, read) = stream.split();

        *self.write.lock().await = Some(write);
        *self.read.lock().await = Some(read);
        self.connected.store(true, Ordering::SeqCst);
        info!(server = %self.settings.server_url, "connected to the server");

        let hook = self.on_connect.lock().expect("on_connect mutex").clone();
        if let Some(hook) = hook {
            hook().await;
        }

        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.write.lock().await.take() {
            let _ = sink.close().await;
        }
        self.read.lock().await.take();
        self.mark_disconnected();
        info!("disconnected from the server");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
