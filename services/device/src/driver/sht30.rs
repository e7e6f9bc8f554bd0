//! Sensirion SHT30 temperature and humidity sensor.
//!
//! Data sheet:
//! https://sensirion.com/media/documents/213E6A3B/63A5A569/Datasheet_SHT3x_DIS.pdf

use std::collections::BTreeMap;

use meridian_edge::driver_config::{
    BusClaim, DriverDirection, DriverMetadata, DriverSignal, I2cAddress,
};
use meridian_edge::units::UnitOfMeasurement;
use serde::Deserialize;

use crate::driver::{
    AnalogInputDriver, BusProtocol, DeviceDriver, DriverCore, DriverError, require_direction,
};
use crate::helpers::crc8;
use crate::hw::{self, I2cBus};
use crate::registry::{RegistryError, parse_config};

pub const MODULE: &str = "sht30";

fn default_protocol() -> BusProtocol {
    BusProtocol::I2c
}

fn default_direction() -> DriverDirection {
    DriverDirection::Input
}

fn default_address() -> I2cAddress {
    I2cAddress::new(0x44).expect("0x44 is a valid address")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sht30Config {
    pub identifier: String,
    pub driver_module: String,
    #[serde(default = "default_protocol")]
    pub protocol: BusProtocol,
    #[serde(default = "default_direction")]
    pub direction: DriverDirection,
    #[serde(default = "default_address")]
    pub address: I2cAddress,
}

pub struct Sht30 {
    identifier: String,
    driver_module: String,
    address: I2cAddress,
    bus: Option<Box<dyn I2cBus>>,
}

impl Sht30 {
    /// Addresses the sensor can be strapped to.
    pub const I2C_ADDRESSES: [u8; 2] = [0x44, 0x45];

    /// Start a measurement with clock stretching disabled.
    const REG_MEASURE: u8 = 0x2C;
    /// High repeatability measurement.
    const PARAM_HIGH_REPEATABILITY: u8 = 0x06;
    /// Read back the measurement data.
    const REG_DATA: u8 = 0x00;

    const READ_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

    pub fn new(config: Sht30Config, driver_module: &str) -> Result<Self, DriverError> {
        if config.protocol != BusProtocol::I2c {
            return Err(DriverError::InvalidConfig {
                identifier: config.identifier,
                reason: "sht30 is an i2c driver".to_owned(),
            });
        }
        require_direction(&config.identifier, config.direction, DriverDirection::Input)?;
        if !Self::I2C_ADDRESSES.contains(&config.address.get()) {
            return Err(DriverError::InvalidConfig {
                identifier: config.identifier,
                reason: format!(
                    "the SHT30 address must be 0x44 or 0x45, got {}",
                    config.address
                ),
            });
        }

        Ok(Sht30 {
            identifier: config.identifier,
            driver_module: driver_module.to_owned(),
            address: config.address,
            bus: None,
        })
    }

    fn measurement(&mut self) -> Result<(f64, f64), DriverError> {
        let bus = self.bus.as_mut().ok_or(DriverError::NotSetUp)?;

        bus.write_register(Self::REG_MEASURE, Self::PARAM_HIGH_REPEATABILITY)?;
        std::thread::sleep(Self::READ_DELAY);

        // 6 bytes: MSB temp, LSB temp, CRC temp, MSB hum, LSB hum, CRC hum.
        let mut data = [0u8; 6];
        bus.read_register(Self::REG_DATA, &mut data)?;

        if !validate_word(&data[0..2], data[2]) {
            return Err(DriverError::InvalidData(
                "temperature word failed its checksum".to_owned(),
            ));
        }
        if !validate_word(&data[3..5], data[5]) {
            return Err(DriverError::InvalidData(
                "humidity word failed its checksum".to_owned(),
            ));
        }

        let temperature_raw = u16::from_be_bytes([data[0], data[1]]);
        let humidity_raw = u16::from_be_bytes([data[3], data[4]]);

        let temperature = -45.0 + 175.0 * f64::from(temperature_raw) / f64::from(u16::MAX);
        let humidity = 100.0 * f64::from(humidity_raw) / f64::from(u16::MAX);

        Ok((humidity, temperature))
    }

    #[cfg(test)]
    fn with_bus(mut self, bus: Box<dyn I2cBus>) -> Self {
        self.bus = Some(bus);
        self
    }
}

/// Chapter 4.12, table 20 in the data sheet.
fn validate_word(word: &[u8], expected_crc: u8) -> bool {
    crc8(word, 0xFF, 0x00, 0x31) == expected_crc
}

impl DriverCore for Sht30 {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            identifier: self.identifier.clone(),
            driver_module: self.driver_module.clone(),
            direction: DriverDirection::Input,
            signals: vec![
                DriverSignal {
                    signal_identifier: "temperature".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::Celsius,
                },
                DriverSignal {
                    signal_identifier: "humidity".to_owned(),
                    unit_of_measurement: UnitOfMeasurement::HumidityPercentage,
                },
            ],
        }
    }

    fn setup(&mut self) -> Result<(), DriverError> {
        self.bus = Some(hw::open_i2c(self.address.get()));
        Ok(())
    }

    fn bus_claim(&self) -> Option<BusClaim> {
        Some(BusClaim::I2c(self.address))
    }
}

impl AnalogInputDriver for Sht30 {
    fn read(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        let (humidity, temperature) = self.measurement()?;
        Ok(BTreeMap::from([
            ("temperature".to_owned(), temperature),
            ("humidity".to_owned(), humidity),
        ]))
    }
}

/// Registry constructor.
pub fn build(driver_module: &str, raw: &serde_yaml::Value) -> Result<DeviceDriver, RegistryError> {
    let config: Sht30Config = parse_config(raw)?;
    Ok(DeviceDriver::AnalogInput(Box::new(Sht30::new(
        config,
        driver_module,
    )?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::MockI2cBus;

    fn config(address: u8) -> Sht30Config {
        Sht30Config {
            identifier: "climate".to_owned(),
            driver_module: "sht30".to_owned(),
            protocol: BusProtocol::I2c,
            direction: DriverDirection::Input,
            address: I2cAddress::new(address).unwrap(),
        }
    }

    fn frame(temperature_raw: u16, humidity_raw: u16) -> Vec<u8> {
        let [t_msb, t_lsb] = temperature_raw.to_be_bytes();
        let [h_msb, h_lsb] = humidity_raw.to_be_bytes();
        vec![
            t_msb,
            t_lsb,
            crc8(&[t_msb, t_lsb], 0xFF, 0x00, 0x31),
            h_msb,
            h_lsb,
            crc8(&[h_msb, h_lsb], 0xFF, 0x00, 0x31),
        ]
    }

    #[test]
    fn converts_raw_words_per_the_datasheet() {
        let mut bus = MockI2cBus::new();
        bus.push_response(frame(0x6666, 0x8000));
        let mut driver = Sht30::new(config(0x44), "meridian.device.driver.sht30")
            .unwrap()
            .with_bus(Box::new(bus));

        let reading = driver.read().unwrap();
        assert!((reading["temperature"] - 25.0).abs() < 0.01);
        assert!((reading["humidity"] - 50.0).abs() < 0.01);
    }

    #[test]
    fn rejects_a_corrupted_word() {
        let mut corrupted = frame(0x6666, 0x8000);
        corrupted[2] ^= 0xFF;
        let mut bus = MockI2cBus::new();
        bus.push_response(corrupted);
        let mut driver = Sht30::new(config(0x44), "meridian.device.driver.sht30")
            .unwrap()
            .with_bus(Box::new(bus));

        assert!(matches!(driver.read(), Err(DriverError::InvalidData(_))));
    }

    #[test]
    fn rejects_addresses_other_than_the_strapping_options() {
        assert!(Sht30::new(config(0x48), "meridian.device.driver.sht30").is_err());
        assert!(Sht30::new(config(0x45), "meridian.device.driver.sht30").is_ok());
    }

    #[test]
    fn rejects_an_output_direction() {
        let mut bad = config(0x44);
        bad.direction = DriverDirection::Output;
        assert!(Sht30::new(bad, "meridian.device.driver.sht30").is_err());
    }
}
