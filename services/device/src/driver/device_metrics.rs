//! Host metrics pseudo-driver: reports the device's own vitals as signals.

use std::collections::BTreeMap;

use meridian_edge::driver_config::{DriverDirection, DriverMetadata, DriverSignal};
use meridian_edge::units::UnitOfMeasurement;
use serde::Deserialize;
use sysinfo::{Disks, System};

use crate::driver::{AnalogInputDriver, DeviceDriver, DriverCore, DriverError};
use crate::registry::{RegistryError, parse_config};

pub const MODULE: &str = "device_metrics";

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceMetricsConfig {
    pub identifier: String,
    pub driver_module: String,
}

/// Samples CPU load, CPU temperature, memory and disk usage of the host.
pub struct DeviceMetrics {
    identifier: String,
    driver_module: String,
    system: System,
}

impl DeviceMetrics {
    pub fn new(config: DeviceMetricsConfig, driver_module: &str) -> Self {
        DeviceMetrics {
            identifier: config.identifier,
            driver_module: driver_module.to_owned(),
            system: System::new(),
        }
    }

    /// CPU temperature in °C from the primary thermal zone; 0.0 when the
    /// host has no thermal zone exposed.
    fn read_cpu_temperature() -> f64 {
        std::fs::read_to_string(THERMAL_ZONE)
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .map_or(0.0, |millidegrees| millidegrees / 1000.0)
    }

    fn read_disk_usage_percent() -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"));
        let (total, available) = match root {
            Some(disk) => (disk.total_space(), disk.available_space()),
            None => disks.list().iter().fold((0, 0), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            }),
        };
        if total == 0 {
            return 0.0;
        }
        let used = total.saturating_sub(available);
        used as f64 / total as f64 * 100.0
    }
}

impl DriverCore for DeviceMetrics {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            identifier: self.identifier.clone(),
            driver_module: self.driver_module.clone(),
            direction: DriverDirection::Input,
            signals: vec![
                DriverSignal {
                    signal_identifier: "cpu.load_percent".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::Percentage,
                },
                DriverSignal {
                    signal_identifier: "cpu.temperature".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::Celsius,
                },
                DriverSignal {
                    signal_identifier: "memory.usage_percent".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::Percentage,
                },
                DriverSignal {
                    signal_identifier: "disk.usage_percent".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::Percentage,
                },
            ],
        }
    }

    fn setup(&mut self) -> Result<(), DriverError> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        Ok(())
    }
}

impl AnalogInputDriver for DeviceMetrics {
    fn read(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        // CPU usage is a delta between two refreshes; the sleep is fine
        // here because reads run on the blocking pool.
        self.system.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let memory_percent = if self.system.total_memory() == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / self.system.total_memory() as f64 * 100.0
        };

        Ok(BTreeMap::from([
            (
                "cpu.load_percent".to_owned(),
                f64::from(self.system.global_cpu_usage()),
            ),
            ("cpu.temperature".to_owned(), Self::read_cpu_temperature()),
            ("memory.usage_percent".to_owned(), memory_percent),
            ("disk.usage_percent".to_owned(), Self::read_disk_usage_percent()),
        ]))
    }
}

/// Registry constructor.
pub fn build(driver_module: &str, raw: &serde_yaml::Value) -> Result<DeviceDriver, RegistryError> {
    let config: DeviceMetricsConfig = parse_config(raw)?;
    Ok(DeviceDriver::AnalogInput(Box::new(DeviceMetrics::new(
        config,
        driver_module,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_every_declared_signal() {
        let mut driver = DeviceMetrics::new(
            DeviceMetricsConfig {
                identifier: "host".to_owned(),
                driver_module: "device_metrics".to_owned(),
            },
            "meridian.device.driver.device_metrics",
        );
        driver.setup().unwrap();

        let reading = driver.read().unwrap();
        let declared: Vec<String> = driver
            .metadata()
            .signals
            .into_iter()
            .map(|signal| signal.signal_identifier)
            .collect();
        for signal in &declared {
            assert!(reading.contains_key(signal), "missing signal {signal}");
        }
        assert_eq!(reading.len(), declared.len());
    }

    #[test]
    fn percentages_are_within_range() {
        let mut driver = DeviceMetrics::new(
            DeviceMetricsConfig {
                identifier: "host".to_owned(),
                driver_module: "device_metrics".to_owned(),
            },
            "meridian.device.driver.device_metrics",
        );
        driver.setup().unwrap();

        let reading = driver.read().unwrap();
        for signal in ["cpu.load_percent", "memory.usage_percent", "disk.usage_percent"] {
            let value = reading[signal];
            assert!((0.0..=100.0).contains(&value), "{signal} = {value}");
        }
    }
}
