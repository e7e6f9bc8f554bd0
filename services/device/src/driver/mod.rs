//! Driver capability traits and the built-in drivers.
//!
//! Every driver classifies as analog input, digital input or digital
//! output and exposes typed signals. Reads and writes are blocking calls
//! against the hardware ports; the driver manager offloads them to the
//! blocking pool.

pub mod contact;
pub mod device_metrics;
pub mod relay;
pub mod sht30;
pub mod si1145;

use std::collections::BTreeMap;

use meridian_edge::driver_config::{BusClaim, DriverDirection, DriverMetadata};
use serde::Deserialize;

use crate::hw::HardwareError;

/// The bus protocol a driver configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusProtocol {
    Gpio,
    I2c,
}

/// Errors raised by driver construction and operation.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error("invalid sensor data: {0}")]
    InvalidData(String),
    #[error("driver '{identifier}' rejected its configuration: {reason}")]
    InvalidConfig { identifier: String, reason: String },
    #[error("driver has not been set up")]
    NotSetUp,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Behaviour every driver shares, independent of its direction.
pub trait DriverCore: Send {
    /// The identifier, module, direction and signals of this driver.
    fn metadata(&self) -> DriverMetadata;

    /// Claim the hardware resources. Called exactly once before the first
    /// read or write.
    fn setup(&mut self) -> Result<(), DriverError>;

    /// The bus resource this driver occupies, used for the device-wide
    /// address-space validation.
    fn bus_claim(&self) -> Option<BusClaim> {
        None
    }
}

/// A driver producing floating-point readings.
pub trait AnalogInputDriver: DriverCore {
    fn read(&mut self) -> Result<BTreeMap<String, f64>, DriverError>;

    /// One read, for validating a configuration by hand.
    fn test(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        self.read()
    }
}

/// A driver producing boolean readings.
pub trait DigitalInputDriver: DriverCore {
    fn read(&mut self) -> Result<BTreeMap<String, bool>, DriverError>;

    fn test(&mut self) -> Result<BTreeMap<String, bool>, DriverError> {
        self.read()
    }
}

/// A driver accepting a boolean output state.
pub trait DigitalOutputDriver: DriverCore {
    fn set(&mut self, value: bool) -> Result<(), DriverError>;

    /// Toggles off, on for one second, then off again.
    fn test(&mut self) -> Result<(), DriverError> {
        self.set(false)?;
        self.set(true)?;
        std::thread::sleep(std::time::Duration::from_secs(1));
        self.set(false)
    }
}

// ---------------------------------------------------------------------------
// Tagged driver variants
// ---------------------------------------------------------------------------

/// A built driver, tagged by capability.
pub enum DeviceDriver {
    AnalogInput(Box<dyn AnalogInputDriver>),
    DigitalInput(Box<dyn DigitalInputDriver>),
    DigitalOutput(Box<dyn DigitalOutputDriver>),
}

impl DeviceDriver {
    pub fn metadata(&self) -> DriverMetadata {
        match self {
            DeviceDriver::AnalogInput(driver) => driver.metadata(),
            DeviceDriver::DigitalInput(driver) => driver.metadata(),
            DeviceDriver::DigitalOutput(driver) => driver.metadata(),
        }
    }

    pub fn setup(&mut self) -> Result<(), DriverError> {
        match self {
            DeviceDriver::AnalogInput(driver) => driver.setup(),
            DeviceDriver::DigitalInput(driver) => driver.setup(),
            DeviceDriver::DigitalOutput(driver) => driver.setup(),
        }
    }

    pub fn bus_claim(&self) -> Option<BusClaim> {
        match self {
            DeviceDriver::AnalogInput(driver) => driver.bus_claim(),
            DeviceDriver::DigitalInput(driver) => driver.bus_claim(),
            DeviceDriver::DigitalOutput(driver) => driver.bus_claim(),
        }
    }

    /// Whether the sampling scheduler should poll this driver.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            DeviceDriver::AnalogInput(_) | DeviceDriver::DigitalInput(_)
        )
    }

    /// Read the driver as a map of float samples.
    ///
    /// Digital readings map to 0.0/1.0 so every sample takes the same path
    /// through the buffer and the store. Fails on output drivers.
    pub fn read_values(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        match self {
            DeviceDriver::AnalogInput(driver) => driver.read(),
            DeviceDriver::DigitalInput(driver) => Ok(driver
                .read()?
                .into_iter()
                .map(|(signal, level)| (signal, f64::from(u8::from(level))))
                .collect()),
            DeviceDriver::DigitalOutput(driver) => Err(DriverError::InvalidConfig {
                identifier: driver.metadata().identifier,
                reason: "output drivers cannot be read".to_owned(),
            }),
        }
    }
}

/// Checks a configured direction against what the driver supports.
pub(crate) fn require_direction(
    identifier: &str,
    configured: DriverDirection,
    expected: DriverDirection,
) -> Result<(), DriverError> {
    let compatible = match expected {
        DriverDirection::Input => configured.is_input(),
        DriverDirection::Output => configured.is_output(),
        DriverDirection::Bidirectional => true,
    };
    if compatible {
        Ok(())
    } else {
        Err(DriverError::InvalidConfig {
            identifier: identifier.to_owned(),
            reason: format!("direction '{configured}' is not usable as {expected}"),
        })
    }
}
