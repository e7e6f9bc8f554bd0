//! GPIO relay output. The relay board is active-low: a high pin level
//! means off.

use meridian_edge::driver_config::{
    BusClaim, DriverDirection, DriverMetadata, DriverSignal, GpioPin,
};
use meridian_edge::units::UnitOfMeasurement;
use serde::Deserialize;

use crate::driver::{
    BusProtocol, DeviceDriver, DigitalOutputDriver, DriverCore, DriverError, require_direction,
};
use crate::hw::{self, GpioOutputPin};
use crate::registry::{RegistryError, parse_config};

pub const MODULE: &str = "relay";

fn default_protocol() -> BusProtocol {
    BusProtocol::Gpio
}

fn default_direction() -> DriverDirection {
    DriverDirection::Output
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub identifier: String,
    pub driver_module: String,
    #[serde(default = "default_protocol")]
    pub protocol: BusProtocol,
    #[serde(default = "default_direction")]
    pub direction: DriverDirection,
    pub pin: GpioPin,
}

pub struct Relay {
    identifier: String,
    driver_module: String,
    pin: GpioPin,
    output: Option<Box<dyn GpioOutputPin>>,
}

impl Relay {
    pub fn new(config: RelayConfig, driver_module: &str) -> Result<Self, DriverError> {
        if config.protocol != BusProtocol::Gpio {
            return Err(DriverError::InvalidConfig {
                identifier: config.identifier,
                reason: "relay is a gpio driver".to_owned(),
            });
        }
        require_direction(&config.identifier, config.direction, DriverDirection::Output)?;

        Ok(Relay {
            identifier: config.identifier,
            driver_module: driver_module.to_owned(),
            pin: config.pin,
            output: None,
        })
    }

    #[cfg(test)]
    fn with_output(mut self, output: Box<dyn GpioOutputPin>) -> Self {
        self.output = Some(output);
        self
    }
}

impl DriverCore for Relay {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            identifier: self.identifier.clone(),
            driver_module: self.driver_module.clone(),
            direction: DriverDirection::Output,
            signals: vec![DriverSignal {
                signal_identifier: "state".to_owned(),
                unit_of_measurement: UnitOfMeasurement::UnitLess,
            }],
        }
    }

    fn setup(&mut self) -> Result<(), DriverError> {
        let mut output = hw::open_gpio_output(self.pin.get());
        // Off until told otherwise.
        output.set_high()?;
        self.output = Some(output);
        Ok(())
    }

    fn bus_claim(&self) -> Option<BusClaim> {
        Some(BusClaim::Gpio(self.pin))
    }
}

impl DigitalOutputDriver for Relay {
    fn set(&mut self, value: bool) -> Result<(), DriverError> {
        let output = self.output.as_mut().ok_or(DriverError::NotSetUp)?;
        if value {
            output.set_low()?;
        } else {
            output.set_high()?;
        }
        Ok(())
    }
}

/// Registry constructor.
pub fn build(driver_module: &str, raw: &serde_yaml::Value) -> Result<DeviceDriver, RegistryError> {
    let config: RelayConfig = parse_config(raw)?;
    Ok(DeviceDriver::DigitalOutput(Box::new(Relay::new(
        config,
        driver_module,
    )?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MockGpioPin;

    fn config() -> RelayConfig {
        RelayConfig {
            identifier: "pump".to_owned(),
            driver_module: "relay".to_owned(),
            protocol: BusProtocol::Gpio,
            direction: DriverDirection::Output,
            pin: GpioPin::new(17).unwrap(),
        }
    }

    #[test]
    fn on_drives_the_pin_low() {
        let pin = MockGpioPin::new();
        let mut relay = Relay::new(config(), "meridian.device.driver.relay")
            .unwrap()
            .with_output(Box::new(pin.clone()));

        relay.set(true).unwrap();
        assert!(!pin.level());
        relay.set(false).unwrap();
        assert!(pin.level());
    }

    #[test]
    fn rejects_an_input_direction() {
        let mut bad = config();
        bad.direction = DriverDirection::Input;
        assert!(Relay::new(bad, "meridian.device.driver.relay").is_err());
    }
}
