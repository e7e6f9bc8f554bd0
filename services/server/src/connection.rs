//! Tracks the active channel of every connected device.
//!
//! At most one channel per device id: a newer connection replaces the old
//! mapping and closes the previous channel. The first thing a freshly
//! added device receives is the server's `EDGE_VERSION` greeting.

use std::collections::HashMap;
use std::sync::Arc;

use meridian_edge::DeviceId;
use meridian_edge::channel::{ChannelError, EdgeChannel};
use meridian_edge::messages::{EdgeMessage, EdgeVersionPayload};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct ConnectionManager<C: EdgeChannel> {
    connections: RwLock<HashMap<DeviceId, Arc<C>>>,
    /// The edge software version announced to every connecting device.
    edge_version: String,
}

impl<C: EdgeChannel> ConnectionManager<C> {
    pub fn new(edge_version: &str) -> Self {
        ConnectionManager {
            connections: RwLock::new(HashMap::new()),
            edge_version: edge_version.to_owned(),
        }
    }

    /// Register a device's channel and send the version greeting.
    ///
    /// An existing channel for the same device is replaced and closed.
    pub async fn add(&self, device_id: DeviceId, channel: Arc<C>) -> Result<(), ConnectionError> {
        let previous = self
            .connections
            .write()
            .await
            .insert(device_id, Arc::clone(&channel));
        if let Some(previous) = previous {
            warn!(device_id = %device_id, "replacing an existing connection");
            previous.disconnect().await;
        }

        channel
            .send(&EdgeMessage::EdgeVersion(EdgeVersionPayload {
                version: self.edge_version.clone(),
            }))
            .await?;
        info!(device_id = %device_id, "device connected");
        Ok(())
    }

    /// Forget the device's channel. Idempotent.
    pub async fn remove(&self, device_id: DeviceId) {
        if self.connections.write().await.remove(&device_id).is_some() {
            info!(device_id = %device_id, "device disconnected");
        }
    }

    /// Send one message to one device; fails when it is not connected.
    pub async fn send(
        &self,
        device_id: DeviceId,
        message: &EdgeMessage,
    ) -> Result<(), ConnectionError> {
        let channel = self
            .connections
            .read()
            .await
            .get(&device_id)
            .cloned()
            .ok_or(ConnectionError::NotConnected(device_id))?;
        channel.send(message).await?;
        Ok(())
    }

    /// Send one message to every connected device.
    pub async fn broadcast(&self, message: &EdgeMessage) {
        let channels: Vec<(DeviceId, Arc<C>)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, channel)| (*id, Arc::clone(channel)))
            .collect();
        for (device_id, channel) in channels {
            if let Err(err) = channel.send(message).await {
                warn!(device_id = %device_id, error = %err, "broadcast send failed");
            }
        }
    }

    pub async fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections.read().await.keys().copied().collect()
    }
}
