//! In-memory channel pair for exercising dispatch and connection logic in
//! tests without a websocket.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{ChannelError, EdgeChannel};
use crate::messages::EdgeMessage;

/// One end of a cross-wired in-memory message pipe.
///
/// Messages sent on one end arrive on the other in order. Dropping or
/// disconnecting an end makes the peer's `receive` resolve with
/// [`ChannelError::Disconnected`] once the buffered messages drain.
pub struct InMemoryChannel {
    tx: StdMutex<Option<mpsc::UnboundedSender<EdgeMessage>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EdgeMessage>>,
    connected: AtomicBool,
}

impl InMemoryChannel {
    /// Create a connected channel pair.
    pub fn pair() -> (InMemoryChannel, InMemoryChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::end(a_tx, a_rx), Self::end(b_tx, b_rx))
    }

    fn end(
        tx: mpsc::UnboundedSender<EdgeMessage>,
        rx: mpsc::UnboundedReceiver<EdgeMessage>,
    ) -> InMemoryChannel {
        InMemoryChannel {
            tx: StdMutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
        }
    }

    /// Non-blocking receive, for asserting that nothing was sent.
    pub fn try_receive(&self) -> Option<EdgeMessage> {
        self.rx
            .try_lock()
            .expect("receive side is not contended in tests")
            .try_recv()
            .ok()
    }
}

#[async_trait]
impl EdgeChannel for InMemoryChannel {
    async fn send(&self, message: &EdgeMessage) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        let guard = self.tx.lock().expect("sender mutex");
        match guard.as_ref() {
            Some(tx) => tx
                .send(message.clone())
                .map_err(|_| ChannelError::Disconnected),
            None => Err(ChannelError::Disconnected),
        }
    }

    async fn receive(&self) -> Result<EdgeMessage, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(ChannelError::Disconnected)
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender lets the peer's receive drain and end.
        self.tx.lock().expect("sender mutex").take();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
