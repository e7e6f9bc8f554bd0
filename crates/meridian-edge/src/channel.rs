//! The full-duplex message channel between a device and the server.
//!
//! Both sides of the link implement [`EdgeChannel`] over their respective
//! websocket halves; everything above the channel (dispatch, staging,
//! ingestion) is transport-agnostic. Channels deliver whole envelopes in
//! FIFO order and perform no retries — reconnection policy belongs to the
//! caller.

use async_trait::async_trait;
use tracing::warn;

use crate::messages::EdgeMessage;

/// Errors surfaced by channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The connection attempt failed. Retried by the device's backoff
    /// policy; fatal for a server-side channel.
    #[error("connection attempt failed: {0}")]
    ConnectFailed(String),
    /// The underlying stream is closed. Unwinds the dispatch loop.
    #[error("the connection is disconnected")]
    Disconnected,
}

/// A full-duplex, ordered channel carrying [`EdgeMessage`] envelopes.
#[async_trait]
pub trait EdgeChannel: Send + Sync + 'static {
    /// Send one message to the peer.
    async fn send(&self, message: &EdgeMessage) -> Result<(), ChannelError>;

    /// Receive the next message from the peer.
    ///
    /// Malformed frames are logged and skipped; the call resolves with the
    /// next well-formed message or [`ChannelError::Disconnected`] once the
    /// stream closes.
    async fn receive(&self) -> Result<EdgeMessage, ChannelError>;

    /// Establish the connection. Idempotent: calling on an already
    /// connected channel is a no-op. Fires the connect hook on success.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Tear the connection down.
    async fn disconnect(&self);

    /// Whether the channel currently has a live connection.
    fn is_connected(&self) -> bool;
}

/// Decode one wire frame, logging and discarding malformed input.
///
/// Shared by the channel implementations: a bad frame from the peer must
/// never tear the connection down.
pub fn decode_frame(frame: &str) -> Option<EdgeMessage> {
    match EdgeMessage::decode(frame) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, "skipping malformed frame");
            None
        }
    }
}
