//! Message dispatch: reads messages from a channel and routes them to the
//! handler registered for their type.
//!
//! Ships with built-in PING/PONG handlers. Handler failures are logged and
//! the loop continues; only [`ChannelError::Disconnected`] or an explicit
//! [`CommunicationHandler::stop`] terminates it. Handlers for one endpoint
//! never run concurrently, which preserves per-endpoint FIFO dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::DeviceId;
use crate::channel::{ChannelError, EdgeChannel};
use crate::messages::{EdgeMessage, MessageType};

/// Errors returned by message handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler failed to use the channel. A disconnect unwinds the
    /// dispatch loop; anything else is logged and skipped.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Any other handler failure; logged, never fatal to the loop.
    #[error("{0}")]
    Other(String),
}

/// A handler for one message type.
///
/// The `(channel, message)` shape is part of the protocol contract; the
/// trait makes a mismatched handler a compile error.
#[async_trait]
pub trait MessageHandler<C: EdgeChannel>: Send + Sync {
    async fn handle(&self, channel: Arc<C>, message: EdgeMessage) -> Result<(), HandlerError>;
}

/// Observer invoked for every received message before it is dispatched.
///
/// The server uses this to bump a device's last-seen timestamp; the update
/// happens-before the handler of the same message runs.
#[async_trait]
pub trait MessageObserver: Send + Sync {
    async fn on_message(&self, device_id: DeviceId, message: &EdgeMessage);
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

struct PingHandler;

#[async_trait]
impl<C: EdgeChannel> MessageHandler<C> for PingHandler {
    async fn handle(&self, channel: Arc<C>, _message: EdgeMessage) -> Result<(), HandlerError> {
        channel.send(&EdgeMessage::Pong).await?;
        Ok(())
    }
}

struct PongHandler;

#[async_trait]
impl<C: EdgeChannel> MessageHandler<C> for PongHandler {
    async fn handle(&self, _channel: Arc<C>, _message: EdgeMessage) -> Result<(), HandlerError> {
        debug!("received pong");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommunicationHandler
// ---------------------------------------------------------------------------

/// Owns a channel and a registry of handlers keyed by message type.
pub struct CommunicationHandler<C: EdgeChannel> {
    channel: Arc<C>,
    device_id: DeviceId,
    handlers: HashMap<MessageType, Box<dyn MessageHandler<C>>>,
    observer: Option<Box<dyn MessageObserver>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<C: EdgeChannel> CommunicationHandler<C> {
    /// Create a handler with the built-in PING/PONG handlers registered.
    pub fn new(channel: Arc<C>, device_id: DeviceId) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handler = CommunicationHandler {
            channel,
            device_id,
            handlers: HashMap::new(),
            observer: None,
            stop_tx,
            stop_rx,
        };
        handler.register_handler(MessageType::Ping, Box::new(PingHandler));
        handler.register_handler(MessageType::Pong, Box::new(PongHandler));
        handler
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn channel(&self) -> Arc<C> {
        Arc::clone(&self.channel)
    }

    /// Register (or replace) the handler for a message type.
    pub fn register_handler(
        &mut self,
        message_type: MessageType,
        handler: Box<dyn MessageHandler<C>>,
    ) {
        self.handlers.insert(message_type, handler);
    }

    /// Register an observer that sees every message before dispatch.
    pub fn set_observer(&mut self, observer: Box<dyn MessageObserver>) {
        self.observer = Some(observer);
    }

    /// Request the dispatch loop to exit. Advisory: takes effect between
    /// messages, after the in-flight handler returns.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Send a message through the underlying channel.
    pub async fn send(&self, message: &EdgeMessage) -> Result<(), ChannelError> {
        debug!(message_type = %message.message_type(), "sending message");
        self.channel.send(message).await
    }

    /// Read and dispatch messages until the channel disconnects or
    /// [`CommunicationHandler::stop`] is called.
    pub async fn listen(&self) -> Result<(), ChannelError> {
        if !self.channel.is_connected() {
            self.channel.connect().await?;
        }

        let mut stop_rx = self.stop_rx.clone();
        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Ok(());
                    }
                }
                received = self.channel.receive() => {
                    let message = received?;
                    self.handle_message(message).await?;
                }
            }
        }
    }

    /// Dispatch one message to its registered handler.
    ///
    /// Returns `Err` only when a handler loses the connection; every other
    /// handler failure is logged and swallowed.
    pub async fn handle_message(&self, message: EdgeMessage) -> Result<(), ChannelError> {
        let message_type = message.message_type();
        debug!(message_type = %message_type, "received message");

        if let Some(observer) = &self.observer {
            observer.on_message(self.device_id, &message).await;
        }

        let Some(handler) = self.handlers.get(&message_type) else {
            warn!(message_type = %message_type, "no handler registered for message type");
            return Ok(());
        };

        match handler.handle(Arc::clone(&self.channel), message).await {
            Ok(()) => Ok(()),
            Err(HandlerError::Channel(ChannelError::Disconnected)) => {
                Err(ChannelError::Disconnected)
            }
            Err(err) => {
                warn!(message_type = %message_type, error = %err, "message handler failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn device_id() -> DeviceId {
        "0191d9b4-6f5a-7cde-8f00-000000000001".parse().unwrap()
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (local, remote) = InMemoryChannel::pair();
        let handler = CommunicationHandler::new(Arc::new(local), device_id());

        handler.handle_message(EdgeMessage::Ping).await.unwrap();

        assert_eq!(remote.receive().await.unwrap(), EdgeMessage::Pong);
    }

    #[tokio::test]
    async fn pong_is_a_no_op() {
        let (local, remote) = InMemoryChannel::pair();
        let handler = CommunicationHandler::new(Arc::new(local), device_id());

        handler.handle_message(EdgeMessage::Pong).await.unwrap();

        assert!(remote.try_receive().is_none());
    }

    struct FailingHandler;

    #[async_trait]
    impl<C: EdgeChannel> MessageHandler<C> for FailingHandler {
        async fn handle(&self, _: Arc<C>, _: EdgeMessage) -> Result<(), HandlerError> {
            Err(HandlerError::Other("boom".to_owned()))
        }
    }

    #[tokio::test]
    async fn handler_failures_do_not_unwind_dispatch() {
        let (local, _remote) = InMemoryChannel::pair();
        let mut handler = CommunicationHandler::new(Arc::new(local), device_id());
        handler.register_handler(MessageType::Pong, Box::new(FailingHandler));

        assert!(handler.handle_message(EdgeMessage::Pong).await.is_ok());
    }

    #[tokio::test]
    async fn listen_dispatches_in_fifo_order_and_ends_on_disconnect() {
        struct Recorder(Arc<tokio::sync::Mutex<Vec<String>>>);

        #[async_trait]
        impl<C: EdgeChannel> MessageHandler<C> for Recorder {
            async fn handle(&self, _: Arc<C>, message: EdgeMessage) -> Result<(), HandlerError> {
                if let EdgeMessage::EdgeVersion(payload) = message {
                    self.0.lock().await.push(payload.version);
                }
                Ok(())
            }
        }

        let (local, remote) = InMemoryChannel::pair();
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut handler = CommunicationHandler::new(Arc::new(local), device_id());
        handler.register_handler(MessageType::EdgeVersion, Box::new(Recorder(seen.clone())));

        for version in ["1.0.0", "1.0.1", "1.0.2"] {
            remote
                .send(&EdgeMessage::EdgeVersion(crate::messages::EdgeVersionPayload {
                    version: version.to_owned(),
                }))
                .await
                .unwrap();
        }
        remote.disconnect().await;

        let result = handler.listen().await;
        assert!(matches!(result, Err(ChannelError::Disconnected)));
        assert_eq!(*seen.lock().await, vec!["1.0.0", "1.0.1", "1.0.2"]);
    }

    #[tokio::test]
    async fn stop_exits_the_loop_between_messages() {
        let (local, _remote) = InMemoryChannel::pair();
        let handler = Arc::new(CommunicationHandler::new(Arc::new(local), device_id()));

        let listener = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.listen().await })
        };
        tokio::task::yield_now().await;
        handler.stop();

        let result = listener.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn observer_runs_before_dispatch() {
        struct Counter(Arc<AtomicUsize>);

        #[async_trait]
        impl MessageObserver for Counter {
            async fn on_message(&self, _: DeviceId, _: &EdgeMessage) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (local, _remote) = InMemoryChannel::pair();
        let count = Arc::new(AtomicUsize::new(0));
        let mut handler = CommunicationHandler::new(Arc::new(local), device_id());
        handler.set_observer(Box::new(Counter(count.clone())));

        handler.handle_message(EdgeMessage::Pong).await.unwrap();
        handler.handle_message(EdgeMessage::Pong).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
