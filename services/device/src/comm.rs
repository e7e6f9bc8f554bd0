//! Device-side message handlers and the reconnecting listen loop.
//!
//! On top of the built-in PING/PONG handlers the device reacts to:
//! - `EDGE_VERSION` — compare against the build version, trigger the
//!   updater when the server knows a strictly newer one.
//! - `DEVICE_CONFIG_RESPONSE` — write the server timeseries ids into the
//!   local index so buffered samples become eligible for staging.
//! - `DEVICE_DATA_ACK` — delete the confirmed batch from the buffer.

use std::sync::Arc;

use async_trait::async_trait;
use meridian_edge::channel::{ChannelError, EdgeChannel};
use meridian_edge::handler::{CommunicationHandler, HandlerError, MessageHandler};
use meridian_edge::messages::EdgeMessage;
use semver::Version;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::retry::{BackOff, RetryStrategy};
use crate::storage::blackbox::Blackbox;
use crate::update::Updater;
use crate::websocket::DeviceWebsocketClient;

/// The version of this build, compared against `EDGE_VERSION` payloads.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// EDGE_VERSION
// ---------------------------------------------------------------------------

pub struct EdgeVersionHandler {
    current: Version,
    updater: Arc<dyn Updater>,
}

impl EdgeVersionHandler {
    pub fn new(updater: Arc<dyn Updater>) -> Result<Self, semver::Error> {
        Ok(EdgeVersionHandler {
            current: Version::parse(VERSION)?,
            updater,
        })
    }

    #[cfg(test)]
    fn with_version(current: &str, updater: Arc<dyn Updater>) -> Self {
        EdgeVersionHandler {
            current: Version::parse(current).unwrap(),
            updater,
        }
    }
}

#[async_trait]
impl<C: EdgeChannel> MessageHandler<C> for EdgeVersionHandler {
    async fn handle(&self, _channel: Arc<C>, message: EdgeMessage) -> Result<(), HandlerError> {
        let EdgeMessage::EdgeVersion(payload) = message else {
            return Ok(());
        };

        // Version strings may carry a leading 'v'; the parser does not.
        let announced = Version::parse(payload.version.trim_start_matches('v'))
            .map_err(|e| HandlerError::Other(format!("unparsable edge version: {e}")))?;

        if announced > self.current {
            info!(current = %self.current, announced = %announced, "edge software is outdated");
            self.updater.update();
        } else {
            info!(current = %self.current, "edge software is up to date");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DEVICE_CONFIG_RESPONSE
// ---------------------------------------------------------------------------

pub struct DeviceConfigResponseHandler {
    blackbox: Arc<Mutex<Blackbox>>,
}

impl DeviceConfigResponseHandler {
    pub fn new(blackbox: Arc<Mutex<Blackbox>>) -> Self {
        DeviceConfigResponseHandler { blackbox }
    }
}

#[async_trait]
impl<C: EdgeChannel> MessageHandler<C> for DeviceConfigResponseHandler {
    async fn handle(&self, _channel: Arc<C>, message: EdgeMessage) -> Result<(), HandlerError> {
        let EdgeMessage::DeviceConfigResponse(payload) = message else {
            return Ok(());
        };

        let mut blackbox = self.blackbox.lock().await;
        for (driver, signals) in &payload.timeseries_index {
            for (signal, server_timeseries_id) in signals {
                let entry = blackbox
                    .ensure_index(driver, signal)
                    .map_err(|e| HandlerError::Other(e.to_string()))?;
                blackbox
                    .update_index(entry.timeseries_id, Some(*server_timeseries_id))
                    .map_err(|e| HandlerError::Other(e.to_string()))?;
            }
        }
        info!("reconciled the server timeseries index");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DEVICE_DATA_ACK
// ---------------------------------------------------------------------------

pub struct DeviceDataAckHandler {
    blackbox: Arc<Mutex<Blackbox>>,
}

impl DeviceDataAckHandler {
    pub fn new(blackbox: Arc<Mutex<Blackbox>>) -> Self {
        DeviceDataAckHandler { blackbox }
    }
}

#[async_trait]
impl<C: EdgeChannel> MessageHandler<C> for DeviceDataAckHandler {
    async fn handle(&self, _channel: Arc<C>, message: EdgeMessage) -> Result<(), HandlerError> {
        let EdgeMessage::DeviceDataAck(payload) = message else {
            return Ok(());
        };

        self.blackbox
            .lock()
            .await
            .confirm(&payload.staging_id)
            .map_err(|e| HandlerError::Other(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconnecting listen loop
// ---------------------------------------------------------------------------

/// Run the dispatch loop; on disconnect, reconnect with backoff and resume.
///
/// Returns `Ok` only after an explicit stop. Reconnect attempts retry
/// indefinitely — a device that cannot reach its server keeps trying.
pub async fn listen_with_reconnect(
    handler: &CommunicationHandler<DeviceWebsocketClient>,
) -> Result<(), ChannelError> {
    loop {
        match handler.listen().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "connection lost; reconnecting");
                let channel = handler.channel();
                BackOff::default()
                    .execute(
                        || channel.connect(),
                        |e| matches!(e, ChannelError::ConnectFailed(_)),
                    )
                    .await?;
            }
        }
    }
}
