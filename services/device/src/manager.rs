//! The driver manager: builds drivers from configuration, validates the
//! device address space, and samples every input driver on a fixed
//! schedule.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use meridian_edge::driver_config::{DriverMetadata, validate_device_address_space};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{DeviceDriver, DriverError};
use crate::registry::{DriverRegistry, RegistryError};
use crate::storage::blackbox::Blackbox;

/// Time between two consecutive samples of an input driver.
pub const INPUT_SAMPLE_INTERVAL: Duration = Duration::from_secs(150);

struct ManagedDriver {
    metadata: DriverMetadata,
    inner: Arc<StdMutex<DeviceDriver>>,
}

/// Holds the built drivers and schedules their sampling.
pub struct DriverManager {
    drivers: Vec<ManagedDriver>,
    blackbox: Arc<Mutex<Blackbox>>,
    sample_interval: Duration,
}

impl DriverManager {
    /// Build every configured driver and validate the device address space.
    pub fn from_configs(
        registry: &DriverRegistry,
        configs: &[serde_yaml::Value],
        blackbox: Arc<Mutex<Blackbox>>,
    ) -> Result<Self, RegistryError> {
        let mut built = Vec::with_capacity(configs.len());
        for raw in configs {
            built.push(registry.build(raw)?);
        }

        let metadata: Vec<DriverMetadata> = built.iter().map(DeviceDriver::metadata).collect();
        let claims: Vec<_> = built.iter().map(DeviceDriver::bus_claim).collect();
        validate_device_address_space(
            metadata
                .iter()
                .zip(&claims)
                .map(|(meta, claim)| (meta.identifier.as_str(), *claim)),
        )?;

        let drivers = metadata
            .into_iter()
            .zip(built)
            .map(|(metadata, driver)| ManagedDriver {
                metadata,
                inner: Arc::new(StdMutex::new(driver)),
            })
            .collect();

        Ok(DriverManager {
            drivers,
            blackbox,
            sample_interval: INPUT_SAMPLE_INTERVAL,
        })
    }

    /// Override the sampling interval (tests, fast-sampling deployments).
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Set up every driver exactly once.
    pub fn setup(&mut self) -> Result<(), DriverError> {
        for driver in &self.drivers {
            debug!(driver = %driver.metadata.identifier, "setting up driver");
            driver.inner.lock().expect("driver mutex").setup()?;
        }
        Ok(())
    }

    /// The metadata of every configured driver, for the registration
    /// handshake.
    pub fn driver_metadata(&self) -> Vec<DriverMetadata> {
        self.drivers
            .iter()
            .map(|driver| driver.metadata.clone())
            .collect()
    }

    /// Spawn one sampling task per input driver.
    pub fn spawn_sampling_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.drivers
            .iter()
            .filter(|driver| driver.metadata.direction.is_input())
            .map(|driver| {
                tokio::spawn(run_sampler(
                    driver.metadata.identifier.clone(),
                    Arc::clone(&driver.inner),
                    Arc::clone(&self.blackbox),
                    self.sample_interval,
                    shutdown.clone(),
                ))
            })
            .collect()
    }
}

async fn run_sampler(
    identifier: String,
    driver: Arc<StdMutex<DeviceDriver>>,
    blackbox: Arc<Mutex<Blackbox>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(driver = %identifier, "sampling task stopping (shutdown)");
                    return;
                }
            }
            _ = ticker.tick() => {
                sample_once(&identifier, &driver, &blackbox).await;
            }
        }
    }
}

/// One sampling tick: read off the blocking pool, stamp the middle of the
/// read window, hand the reading to the blackbox.
pub async fn sample_once(
    identifier: &str,
    driver: &Arc<StdMutex<DeviceDriver>>,
    blackbox: &Arc<Mutex<Blackbox>>,
) {
    debug!(driver = identifier, "reading driver");

    let read_start = Utc::now();
    let handle = Arc::clone(driver);
    let result =
        tokio::task::spawn_blocking(move || handle.lock().expect("driver mutex").read_values())
            .await;
    let read_end = Utc::now();

    let data = match result {
        Ok(Ok(data)) => data,
        Ok(Err(err)) => {
            warn!(driver = identifier, error = %err, "driver read failed");
            return;
        }
        Err(err) => {
            warn!(driver = identifier, error = %err, "driver read task failed");
            return;
        }
    };

    // Stamp the middle of the read window.
    let read_at = read_start + (read_end - read_start) / 2;

    if let Err(err) = blackbox.lock().await.record(identifier, read_at, &data) {
        warn!(driver = identifier, error = %err, "failed to record reading");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> serde_yaml::Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn make_blackbox() -> (Arc<Mutex<Blackbox>>, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let blackbox = Arc::new(Mutex::new(Blackbox::open(file.path()).unwrap()));
        (blackbox, file)
    }

    #[test]
    fn builds_drivers_and_validates_the_address_space() {
        let registry = DriverRegistry::with_builtins();
        let (blackbox, _file) = make_blackbox();

        let manager = DriverManager::from_configs(
            &registry,
            &[
                yaml("identifier: door\ndriver_module: contact\npin: 27"),
                yaml("identifier: pump\ndriver_module: relay\npin: 17"),
            ],
            blackbox,
        )
        .unwrap();

        let metadata = manager.driver_metadata();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[0].identifier, "door");
    }

    #[test]
    fn colliding_pins_fail_the_build() {
        let registry = DriverRegistry::with_builtins();
        let (blackbox, _file) = make_blackbox();

        let result = DriverManager::from_configs(
            &registry,
            &[
                yaml("identifier: door\ndriver_module: contact\npin: 17"),
                yaml("identifier: pump\ndriver_module: relay\npin: 17"),
            ],
            blackbox,
        );
        assert!(matches!(result, Err(RegistryError::AddressSpace(_))));
    }

    #[tokio::test]
    async fn sample_once_records_into_the_blackbox() {
        let registry = DriverRegistry::with_builtins();
        let (blackbox, _file) = make_blackbox();
        let mut manager = DriverManager::from_configs(
            &registry,
            &[yaml("identifier: door\ndriver_module: contact\npin: 27")],
            Arc::clone(&blackbox),
        )
        .unwrap();
        manager.setup().unwrap();

        let before = Utc::now().timestamp();
        sample_once("door", &manager.drivers[0].inner, &blackbox).await;
        let after = Utc::now().timestamp();

        let mut guard = blackbox.lock().await;
        assert_eq!(guard.sample_count().unwrap(), 1);
        let entries = guard.find_index(Some("door"), Some("closed")).unwrap();
        assert_eq!(entries.len(), 1);

        // The stamped time lies within the read window.
        guard.update_index(entries[0].timeseries_id, Some(1)).unwrap();
        let batch = guard.stage(10).unwrap().unwrap();
        let recorded = batch.data[&1].timestamps_utc[0];
        assert!((before..=after).contains(&recorded));
    }

    #[test]
    fn output_drivers_are_not_scheduled() {
        let registry = DriverRegistry::with_builtins();
        let (blackbox, _file) = make_blackbox();
        let manager = DriverManager::from_configs(
            &registry,
            &[yaml("identifier: pump\ndriver_module: relay\npin: 17")],
            blackbox,
        )
        .unwrap();

        let scheduled = manager
            .drivers
            .iter()
            .filter(|driver| driver.metadata.direction.is_input())
            .count();
        assert_eq!(scheduled, 0);
    }
}
