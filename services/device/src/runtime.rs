//! The device runtime: composition root wiring storage, drivers, the
//! websocket channel and the periodic tasks together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use meridian_edge::channel::{ChannelError, EdgeChannel};
use meridian_edge::handler::CommunicationHandler;
use meridian_edge::messages::{DeviceConfigPayload, EdgeMessage, MessageType};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::comm::{
    DeviceConfigResponseHandler, DeviceDataAckHandler, EdgeVersionHandler, listen_with_reconnect,
};
use crate::config::{ConfigError, ConnectionSettings, DeviceConfig, STORAGE_FILE};
use crate::driver::DriverError;
use crate::manager::{DriverManager, INPUT_SAMPLE_INTERVAL};
use crate::registry::{DriverRegistry, RegistryError};
use crate::retry::{BackOff, RetryStrategy};
use crate::storage::blackbox::{ApiToken, Blackbox, BlackboxError};
use crate::update::{RestartUpdater, Updater};
use crate::websocket::DeviceWebsocketClient;

/// How often the device pings the server.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

/// How often buffered samples are staged and sent. One stager run per
/// sampling interval; redelivery is guaranteed by the staleness window,
/// not by the cadence.
pub const STAGE_INTERVAL: Duration = INPUT_SAMPLE_INTERVAL;

/// Samples staged per run.
pub const STAGE_BATCH_SIZE: usize = 250;

/// Environment variable that seeds the stored API bearer token.
pub const API_TOKEN_ENV: &str = "MERIDIAN_API_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Blackbox(#[from] BlackboxError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid build version: {0}")]
    Version(#[from] semver::Error),
}

/// The composition root of the device binary.
pub struct DeviceRuntime {
    config: DeviceConfig,
    settings: ConnectionSettings,
    registry: DriverRegistry,
    driver_configs: Vec<serde_yaml::Value>,
    updater: Arc<dyn Updater>,
}

impl DeviceRuntime {
    pub fn new(
        config: DeviceConfig,
        settings: ConnectionSettings,
        registry: DriverRegistry,
        driver_configs: Vec<serde_yaml::Value>,
    ) -> Self {
        DeviceRuntime {
            config,
            settings,
            registry,
            driver_configs,
            updater: Arc::new(RestartUpdater),
        }
    }

    /// Replace the update seam (tests, deployments with their own rollout).
    pub fn with_updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = updater;
        self
    }

    /// Run the device until it is stopped.
    ///
    /// Fails fast on startup validation errors (bad config, driver
    /// registry violations); connection problems are retried forever.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let device_id = self.config.device_id;

        let blackbox = Arc::new(Mutex::new(Blackbox::open(Path::new(STORAGE_FILE))?));
        seed_api_token(&blackbox).await?;

        let mut manager = DriverManager::from_configs(
            &self.registry,
            &self.driver_configs,
            Arc::clone(&blackbox),
        )?;
        manager.setup()?;
        let metadata = manager.driver_metadata();
        info!(drivers = metadata.len(), device_id = %device_id, "drivers ready");

        let channel = Arc::new(DeviceWebsocketClient::new(
            self.settings.clone(),
            device_id,
            Arc::clone(&blackbox),
        ));

        // Announce the driver inventory after every successful connect so
        // the server can reply with the timeseries index.
        let announce = metadata.clone();
        let announce_channel = Arc::clone(&channel);
        channel.set_on_connect(Arc::new(move || -> BoxFuture<'static, ()> {
            let channel = Arc::clone(&announce_channel);
            let payload = DeviceConfigPayload {
                drivers: announce.clone(),
            };
            Box::pin(async move {
                if let Err(err) = channel.send(&EdgeMessage::DeviceConfig(payload)).await {
                    warn!(error = %err, "failed to announce the device config");
                }
            })
        }));

        BackOff::default()
            .execute(
                || channel.connect(),
                |e| matches!(e, ChannelError::ConnectFailed(_)),
            )
            .await?;

        let mut handler = CommunicationHandler::new(Arc::clone(&channel), device_id);
        handler.register_handler(
            MessageType::EdgeVersion,
            Box::new(EdgeVersionHandler::new(Arc::clone(&self.updater))?),
        );
        handler.register_handler(
            MessageType::DeviceConfigResponse,
            Box::new(DeviceConfigResponseHandler::new(Arc::clone(&blackbox))),
        );
        handler.register_handler(
            MessageType::DeviceDataAck,
            Box::new(DeviceDataAckHandler::new(Arc::clone(&blackbox))),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _sampling_tasks = manager.spawn_sampling_tasks(shutdown_rx.clone());
        let _ping_task = tokio::spawn(run_ping(Arc::clone(&channel), shutdown_rx.clone()));
        let _stager_task = tokio::spawn(run_stager(
            Arc::clone(&channel),
            Arc::clone(&blackbox),
            shutdown_rx,
        ));

        let result = listen_with_reconnect(&handler).await;
        let _ = shutdown_tx.send(true);
        result.map_err(RuntimeError::from)
    }
}

/// Seed the stored API token from the environment, when provided and when
/// the stored one is missing or expired.
async fn seed_api_token(blackbox: &Arc<Mutex<Blackbox>>) -> Result<(), BlackboxError> {
    let Ok(token) = std::env::var(API_TOKEN_ENV) else {
        return Ok(());
    };
    let mut guard = blackbox.lock().await;
    let stored_valid = guard
        .read_api_token()?
        .is_some_and(|stored| stored.is_valid());
    if !stored_valid {
        guard.write_api_token(&ApiToken {
            token,
            valid_until_utc: Utc::now() + chrono::Duration::days(365),
        })?;
        info!("seeded the API token from the environment");
    }
    Ok(())
}

async fn run_ping(
    channel: Arc<DeviceWebsocketClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = channel.send(&EdgeMessage::Ping).await {
                    warn!(error = %err, "ping failed");
                }
            }
        }
    }
}

/// Stage a bounded batch and send it. A batch that is sent but never
/// acknowledged stays staged and re-qualifies after the staleness window,
/// which is what gives at-least-once delivery.
async fn run_stager(
    channel: Arc<DeviceWebsocketClient>,
    blackbox: Arc<Mutex<Blackbox>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(STAGE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                stage_and_send(&channel, &blackbox).await;
            }
        }
    }
}

async fn stage_and_send(channel: &Arc<DeviceWebsocketClient>, blackbox: &Arc<Mutex<Blackbox>>) {
    let batch = {
        let mut guard = blackbox.lock().await;
        match guard.stage(STAGE_BATCH_SIZE) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "staging failed");
                return;
            }
        }
    };
    let Some(payload) = batch else {
        return;
    };

    let staging_id = payload.staging_id.clone();
    if let Err(err) = channel.send(&EdgeMessage::DeviceData(payload)).await {
        // The rows stay staged; they re-qualify once the staging ages out.
        warn!(staging_id = %staging_id, error = %err, "failed to send staged batch");
    }
}
