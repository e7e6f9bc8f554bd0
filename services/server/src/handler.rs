//! Server-side message handling for one connected device.
//!
//! Every received message first bumps the device's last-seen timestamp.
//! `DEVICE_CONFIG` reconciles the metadata tables and answers with the
//! timeseries index; `DEVICE_DATA` persists the batch and answers with an
//! ack carrying the staging id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meridian_edge::channel::EdgeChannel;
use meridian_edge::handler::{
    CommunicationHandler, HandlerError, MessageHandler, MessageObserver,
};
use meridian_edge::messages::{
    DeviceConfigResponsePayload, DeviceDataAckPayload, EdgeMessage, MessageType,
};
use meridian_edge::DeviceId;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::data::timeseries::add_timeseries;
use crate::repo::devices::set_device_seen;
use crate::repo::metadata::{build_timeseries_index, upsert_driver_metadata};

/// Bumps `last_seen_at` for every message, before it is dispatched.
pub struct LastSeenObserver {
    pool: PgPool,
}

#[async_trait]
impl MessageObserver for LastSeenObserver {
    async fn on_message(&self, device_id: DeviceId, _message: &EdgeMessage) {
        if let Err(err) = set_device_seen(&self.pool, device_id).await {
            warn!(device_id = %device_id, error = %err, "failed to mark device as seen");
        }
    }
}

// ---------------------------------------------------------------------------
// DEVICE_CONFIG
// ---------------------------------------------------------------------------

pub struct DeviceConfigHandler {
    pool: PgPool,
    device_id: DeviceId,
}

#[async_trait]
impl<C: EdgeChannel> MessageHandler<C> for DeviceConfigHandler {
    async fn handle(&self, channel: Arc<C>, message: EdgeMessage) -> Result<(), HandlerError> {
        let EdgeMessage::DeviceConfig(payload) = message else {
            return Ok(());
        };

        upsert_driver_metadata(&self.pool, self.device_id, &payload.drivers)
            .await
            .map_err(|e| HandlerError::Other(e.to_string()))?;

        let timeseries_index = build_timeseries_index(&self.pool, self.device_id)
            .await
            .map_err(|e| HandlerError::Other(e.to_string()))?;

        channel
            .send(&EdgeMessage::DeviceConfigResponse(
                DeviceConfigResponsePayload { timeseries_index },
            ))
            .await?;
        debug!(device_id = %self.device_id, "answered device config");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DEVICE_DATA
// ---------------------------------------------------------------------------

pub struct DeviceDataHandler {
    pool: PgPool,
    device_id: DeviceId,
}

#[async_trait]
impl<C: EdgeChannel> MessageHandler<C> for DeviceDataHandler {
    async fn handle(&self, channel: Arc<C>, message: EdgeMessage) -> Result<(), HandlerError> {
        let EdgeMessage::DeviceData(payload) = message else {
            return Ok(());
        };

        for (timeseries_id, series) in &payload.data {
            let timestamps: Vec<DateTime<Utc>> = series
                .timestamps_utc
                .iter()
                .filter_map(|&seconds| DateTime::from_timestamp(seconds, 0))
                .collect();
            if timestamps.len() != series.timestamps_utc.len() {
                return Err(HandlerError::Other(format!(
                    "series {timeseries_id} carries out-of-range timestamps"
                )));
            }
            let values: Vec<Option<f64>> = series.values.iter().map(|&v| Some(v)).collect();

            add_timeseries(&self.pool, *timeseries_id, &timestamps, &values)
                .await
                .map_err(|e| HandlerError::Other(e.to_string()))?;
        }

        // Only a fully persisted batch is confirmed; anything less and the
        // device re-sends it once the staging goes stale.
        channel
            .send(&EdgeMessage::DeviceDataAck(DeviceDataAckPayload {
                staging_id: payload.staging_id.clone(),
            }))
            .await?;
        debug!(
            device_id = %self.device_id,
            staging_id = %payload.staging_id,
            series = payload.data.len(),
            "persisted device data"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Build the communication handler for one connected device.
pub fn build_device_handler<C: EdgeChannel>(
    pool: PgPool,
    device_id: DeviceId,
    channel: Arc<C>,
) -> CommunicationHandler<C> {
    let mut handler = CommunicationHandler::new(channel, device_id);
    handler.set_observer(Box::new(LastSeenObserver { pool: pool.clone() }));
    handler.register_handler(
        MessageType::DeviceConfig,
        Box::new(DeviceConfigHandler {
            pool: pool.clone(),
            device_id,
        }),
    );
    handler.register_handler(
        MessageType::DeviceData,
        Box::new(DeviceDataHandler { pool, device_id }),
    );
    handler
}
