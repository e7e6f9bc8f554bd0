//! GPIO contact sensor: reports whether a dry contact (door switch, float
//! switch) is closed.

use std::collections::BTreeMap;

use meridian_edge::driver_config::{
    BusClaim, DriverDirection, DriverMetadata, DriverSignal, GpioPin,
};
use meridian_edge::units::UnitOfMeasurement;
use serde::Deserialize;

use crate::driver::{
    BusProtocol, DeviceDriver, DigitalInputDriver, DriverCore, DriverError, require_direction,
};
use crate::hw::{self, GpioInputPin};
use crate::registry::{RegistryError, parse_config};

pub const MODULE: &str = "contact";

fn default_protocol() -> BusProtocol {
    BusProtocol::Gpio
}

fn default_direction() -> DriverDirection {
    DriverDirection::Input
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactConfig {
    pub identifier: String,
    pub driver_module: String,
    #[serde(default = "default_protocol")]
    pub protocol: BusProtocol,
    #[serde(default = "default_direction")]
    pub direction: DriverDirection,
    pub pin: GpioPin,
}

pub struct Contact {
    identifier: String,
    driver_module: String,
    pin: GpioPin,
    input: Option<Box<dyn GpioInputPin>>,
}

impl Contact {
    pub fn new(config: ContactConfig, driver_module: &str) -> Result<Self, DriverError> {
        if config.protocol != BusProtocol::Gpio {
            return Err(DriverError::InvalidConfig {
                identifier: config.identifier,
                reason: "contact is a gpio driver".to_owned(),
            });
        }
        require_direction(&config.identifier, config.direction, DriverDirection::Input)?;

        Ok(Contact {
            identifier: config.identifier,
            driver_module: driver_module.to_owned(),
            pin: config.pin,
            input: None,
        })
    }

    #[cfg(test)]
    fn with_input(mut self, input: Box<dyn GpioInputPin>) -> Self {
        self.input = Some(input);
        self
    }
}

impl DriverCore for Contact {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            identifier: self.identifier.clone(),
            driver_module: self.driver_module.clone(),
            direction: DriverDirection::Input,
            signals: vec![DriverSignal {
                signal_identifier: "closed".to_owned(),
                unit_of_measurement: UnitOfMeasurement::UnitLess,
            }],
        }
    }

    fn setup(&mut self) -> Result<(), DriverError> {
        self.input = Some(hw::open_gpio_input(self.pin.get()));
        Ok(())
    }

    fn bus_claim(&self) -> Option<BusClaim> {
        Some(BusClaim::Gpio(self.pin))
    }
}

impl DigitalInputDriver for Contact {
    fn read(&mut self) -> Result<BTreeMap<String, bool>, DriverError> {
        let input = self.input.as_mut().ok_or(DriverError::NotSetUp)?;
        let closed = input.is_high()?;
        Ok(BTreeMap::from([("closed".to_owned(), closed)]))
    }
}

/// Registry constructor.
pub fn build(driver_module: &str, raw: &serde_yaml::Value) -> Result<DeviceDriver, RegistryError> {
    let config: ContactConfig = parse_config(raw)?;
    Ok(DeviceDriver::DigitalInput(Box::new(Contact::new(
        config,
        driver_module,
    )?)))
}
